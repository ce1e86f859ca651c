//! Spawn Kits
//!
//! What a player carries when they spawn. Fixed per mode family.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::game::state::{ArmourType, PlayerState};
use crate::game::weapon::Weapon;

/// Spawn loadout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnKit {
    /// Blue armour, pistol, one grenade.
    Default,
    /// Green armour and every weapon.
    Efficiency,
    /// One hit point and a rifle.
    Instagib,
    /// Green armour, pistol and two random weapons.
    Tactics,
}

impl SpawnKit {
    /// Arm a freshly reset player state.
    pub fn apply<R: Rng + ?Sized>(self, state: &mut PlayerState, rng: &mut R) {
        state.health = state.max_health;
        state.ammo[Weapon::Fist as usize] = 1;
        match self {
            SpawnKit::Default => {
                state.armour_type = ArmourType::Blue;
                state.armour = 25;
                state.ammo[Weapon::Pistol as usize] = 40;
                state.ammo[Weapon::GrenadeLauncher as usize] = 1;
                state.selected_weapon = Weapon::Pistol;
            }
            SpawnKit::Efficiency => {
                state.armour_type = ArmourType::Green;
                state.armour = 100;
                for w in Weapon::AMMO_WEAPONS {
                    state.ammo[w as usize] = w.spec().pickup_amount * 2;
                }
                state.selected_weapon = Weapon::Chaingun;
            }
            SpawnKit::Instagib => {
                state.health = 1;
                state.armour = 0;
                state.ammo[Weapon::Rifle as usize] = 100;
                state.selected_weapon = Weapon::Rifle;
            }
            SpawnKit::Tactics => {
                state.armour_type = ArmourType::Green;
                state.armour = 100;
                state.ammo[Weapon::Pistol as usize] = 40;
                let pool = [
                    Weapon::Shotgun,
                    Weapon::Chaingun,
                    Weapon::RocketLauncher,
                    Weapon::Rifle,
                    Weapon::GrenadeLauncher,
                ];
                let picks: Vec<Weapon> = pool.choose_multiple(rng, 2).copied().collect();
                for w in &picks {
                    state.ammo[*w as usize] = w.spec().pickup_amount * 2;
                }
                state.selected_weapon = picks.first().copied().unwrap_or(Weapon::Pistol);
            }
        }
    }
}
