//! Weapon Table
//!
//! Static per-weapon properties. Ids match the protocol's gun numbers.

use serde::{Deserialize, Serialize};

/// Weapon (gun) id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[derive(Default)]
pub enum Weapon {
    /// Chainsaw / fist
    Fist = 0,
    /// Shotgun
    Shotgun = 1,
    /// Chaingun
    Chaingun = 2,
    /// Rocket launcher
    RocketLauncher = 3,
    /// Rifle
    Rifle = 4,
    /// Grenade launcher
    GrenadeLauncher = 5,
    /// Pistol
    #[default]
    Pistol = 6,
}

/// Number of player weapons.
pub const NUM_WEAPONS: usize = 7;

/// Static weapon properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeaponSpec {
    /// Milliseconds between shots.
    pub attack_delay: u32,
    /// Damage per ray.
    pub damage: i32,
    /// Maximum hit distance.
    pub range: i32,
    /// Rays per shot.
    pub rays: i32,
    /// Explosion radius, zero for hitscan weapons.
    pub explosion_radius: i32,
    /// Ammo granted by one pickup; spawn kits are multiples of this.
    pub pickup_amount: i32,
}

const SPECS: [WeaponSpec; NUM_WEAPONS] = [
    WeaponSpec { attack_delay: 250, damage: 50, range: 14, rays: 1, explosion_radius: 0, pickup_amount: 0 },
    WeaponSpec { attack_delay: 1400, damage: 10, range: 1024, rays: 20, explosion_radius: 0, pickup_amount: 10 },
    WeaponSpec { attack_delay: 100, damage: 30, range: 1024, rays: 1, explosion_radius: 0, pickup_amount: 20 },
    WeaponSpec { attack_delay: 800, damage: 120, range: 1024, rays: 1, explosion_radius: 40, pickup_amount: 5 },
    WeaponSpec { attack_delay: 1500, damage: 100, range: 2048, rays: 1, explosion_radius: 0, pickup_amount: 5 },
    WeaponSpec { attack_delay: 600, damage: 90, range: 1024, rays: 1, explosion_radius: 45, pickup_amount: 10 },
    WeaponSpec { attack_delay: 500, damage: 35, range: 1024, rays: 1, explosion_radius: 0, pickup_amount: 30 },
];

impl Weapon {
    /// Every weapon in id order.
    pub const ALL: [Weapon; NUM_WEAPONS] = [
        Weapon::Fist,
        Weapon::Shotgun,
        Weapon::Chaingun,
        Weapon::RocketLauncher,
        Weapon::Rifle,
        Weapon::GrenadeLauncher,
        Weapon::Pistol,
    ];

    /// Weapons that carry ammo, in the order the spawn state lists them.
    pub const AMMO_WEAPONS: [Weapon; 6] = [
        Weapon::Shotgun,
        Weapon::Chaingun,
        Weapon::RocketLauncher,
        Weapon::Rifle,
        Weapon::GrenadeLauncher,
        Weapon::Pistol,
    ];

    /// Look up a weapon by wire id.
    pub fn from_id(id: i32) -> Option<Weapon> {
        usize::try_from(id).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    /// Wire id.
    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Static properties.
    #[inline]
    pub fn spec(self) -> &'static WeaponSpec {
        &SPECS[self as usize]
    }

    /// True for weapons whose damage arrives via `Explode`.
    #[inline]
    pub fn is_projectile(self) -> bool {
        self.spec().explosion_radius > 0
    }

    /// True for the melee weapon, which never runs out of ammo.
    #[inline]
    pub fn is_melee(self) -> bool {
        self == Weapon::Fist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for w in Weapon::ALL {
            assert_eq!(Weapon::from_id(w.id()), Some(w));
        }
        assert_eq!(Weapon::from_id(7), None);
        assert_eq!(Weapon::from_id(-1), None);
    }

    #[test]
    fn test_projectiles() {
        assert!(Weapon::RocketLauncher.is_projectile());
        assert!(Weapon::GrenadeLauncher.is_projectile());
        assert!(!Weapon::Rifle.is_projectile());
        assert_eq!(Weapon::Shotgun.spec().rays, 20);
    }
}
