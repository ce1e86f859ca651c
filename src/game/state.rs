//! Player State
//!
//! Per-player combat state. Some fields live for one life (reset on spawn),
//! the rest for one map (reset on map change).
//!
//! ```text
//!   ┌──────────┐ spawn  ┌───────┐ health <= 0 ┌──────┐
//!   │ spectator│───────▶│ alive │────────────▶│ dead │──┐
//!   └──────────┘        └───────┘             └──────┘  │ try spawn
//!         ▲                  ▲                           │
//!         └──── spectate ────┴───────────────────────────┘
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::packet::Packet;
use crate::game::weapon::{Weapon, NUM_WEAPONS};

/// Default maximum health.
pub const DEFAULT_MAX_HEALTH: i32 = 100;

/// Life sequences wrap at this value.
pub const LIFE_SEQUENCE_MOD: i32 = 128;

// =============================================================================
// LIFE STATE
// =============================================================================

/// Client lifecycle state as sent on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[derive(Default)]
pub enum LifeState {
    /// In play
    Alive = 0,
    /// Waiting to respawn
    #[default]
    Dead = 1,
    /// Spawn granted but not confirmed
    Spawning = 2,
    /// Lagged out
    Lagged = 3,
    /// Coop edit mode
    Editing = 4,
    /// Watching
    Spectator = 5,
}

impl LifeState {
    /// Wire id.
    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }
}

// =============================================================================
// ARMOUR
// =============================================================================

/// Armour type. An empty armour value means no armour regardless of type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[derive(Default)]
pub enum ArmourType {
    /// Blue armour
    #[default]
    Blue = 0,
    /// Green armour
    Green = 1,
    /// Yellow armour
    Yellow = 2,
}

impl ArmourType {
    /// Percentage of incoming damage this armour absorbs.
    #[inline]
    pub fn absorption(self) -> i32 {
        match self {
            ArmourType::Blue => 50,
            ArmourType::Green => 75,
            ArmourType::Yellow => 85,
        }
    }

    /// Wire id.
    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// Combat state of one player.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    /// Lifecycle state.
    pub life: LifeState,

    // --- reset on spawn ---
    /// Game time of the last granted spawn, if one is pending confirmation.
    pub last_spawn_attempt: Option<u64>,
    /// Remaining quad damage (ms).
    pub quad_time_left: i32,
    /// Game time of the last shot.
    pub last_shot: u64,
    /// Game time when the current weapon may fire again.
    pub gun_reload_end: u64,
    /// Current health.
    pub health: i32,
    /// Maximum health.
    pub max_health: i32,
    /// Current armour points.
    pub armour: i32,
    /// Armour type.
    pub armour_type: ArmourType,
    /// Selected weapon.
    pub selected_weapon: Weapon,
    /// Ammo per weapon id.
    pub ammo: [i32; NUM_WEAPONS],
    /// Projectiles in flight, by weapon and shot id.
    pub projectiles: BTreeSet<(Weapon, i32)>,

    // --- reset on map change ---
    /// Spawn counter, mod 128.
    pub life_sequence: i32,
    /// Game time of the last death.
    pub last_death: u64,
    /// Frags.
    pub frags: i32,
    /// Deaths.
    pub deaths: i32,
    /// Team kills.
    pub teamkills: i32,
    /// Damage dealt to others.
    pub damage: i32,
    /// Damage that would have been dealt if every shot hit.
    pub damage_potential: i32,
    /// Flags scored.
    pub flags: i32,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            life: LifeState::Dead,
            last_spawn_attempt: None,
            quad_time_left: 0,
            last_shot: 0,
            gun_reload_end: 0,
            health: 0,
            max_health: DEFAULT_MAX_HEALTH,
            armour: 0,
            armour_type: ArmourType::Blue,
            selected_weapon: Weapon::Pistol,
            ammo: [0; NUM_WEAPONS],
            projectiles: BTreeSet::new(),
            life_sequence: 0,
            last_death: 0,
            frags: 0,
            deaths: 0,
            teamkills: 0,
            damage: 0,
            damage_potential: 0,
            flags: 0,
        }
    }
}

impl PlayerState {
    /// Create a fresh state.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if in play.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.life == LifeState::Alive
    }

    /// True if spectating.
    #[inline]
    pub fn is_spectator(&self) -> bool {
        self.life == LifeState::Spectator
    }

    /// Clear per-life fields.
    pub fn reset_for_spawn(&mut self) {
        self.last_spawn_attempt = None;
        self.quad_time_left = 0;
        self.last_shot = 0;
        self.gun_reload_end = 0;
        self.health = 0;
        self.max_health = DEFAULT_MAX_HEALTH;
        self.armour = 0;
        self.armour_type = ArmourType::Blue;
        self.selected_weapon = Weapon::Pistol;
        self.ammo = [0; NUM_WEAPONS];
        self.projectiles.clear();
    }

    /// Clear per-map fields and the per-life ones with them.
    pub fn reset_for_map(&mut self) {
        self.reset_for_spawn();
        self.life_sequence = 0;
        self.last_death = 0;
        self.frags = 0;
        self.deaths = 0;
        self.teamkills = 0;
        self.damage = 0;
        self.damage_potential = 0;
        self.flags = 0;
    }

    /// Start a new life: clear per-life state and advance the life sequence.
    /// The caller applies a spawn kit afterwards.
    pub fn begin_spawn(&mut self, now: u64) {
        self.reset_for_spawn();
        self.life_sequence = (self.life_sequence + 1) % LIFE_SEQUENCE_MOD;
        self.last_spawn_attempt = Some(now);
    }

    /// Confirm a granted spawn. Fails on a stale life sequence or when no
    /// spawn is pending.
    pub fn confirm_spawn(&mut self, life_sequence: i32, weapon: Weapon) -> bool {
        if self.life != LifeState::Dead
            || self.last_spawn_attempt.is_none()
            || life_sequence != self.life_sequence
        {
            return false;
        }
        self.life = LifeState::Alive;
        self.selected_weapon = weapon;
        self.last_spawn_attempt = None;
        true
    }

    /// Switch weapon. Only possible while alive.
    pub fn select_weapon(&mut self, weapon: Weapon) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.selected_weapon = weapon;
        true
    }

    /// Apply incoming damage: armour absorbs its share first, capped at the
    /// armour left, health takes the rest.
    pub fn apply_damage(&mut self, damage: i32) {
        let absorbed = (damage * self.armour_type.absorption() / 100).min(self.armour);
        self.armour -= absorbed;
        self.health -= damage - absorbed;
    }

    /// Mark dead at `now`.
    pub fn die(&mut self, now: u64) {
        self.life = LifeState::Dead;
        self.last_death = now;
        self.deaths += 1;
        self.last_spawn_attempt = None;
        self.projectiles.clear();
    }

    /// Damage multiplier from quad damage.
    #[inline]
    pub fn damage_multiplier(&self) -> i32 {
        if self.quad_time_left > 0 {
            4
        } else {
            1
        }
    }

    /// Validate and book a shot: alive, ammo left, reloaded. Ammo is not
    /// consumed for the melee weapon.
    pub fn try_shoot(&mut self, weapon: Weapon, now: u64) -> bool {
        if !self.is_alive() || now < self.gun_reload_end || self.ammo[weapon as usize] <= 0 {
            return false;
        }
        if !weapon.is_melee() {
            self.ammo[weapon as usize] -= 1;
        }
        let spec = weapon.spec();
        self.last_shot = now;
        self.gun_reload_end = now + spec.attack_delay as u64;
        self.damage_potential += spec.damage * spec.rays * self.damage_multiplier();
        true
    }

    /// Accuracy in percent.
    pub fn accuracy(&self) -> i32 {
        self.damage * 100 / self.damage_potential.max(1)
    }

    /// Health clamped at zero, for reporting.
    pub fn reported_health(&self) -> i32 {
        self.health.max(0)
    }

    /// Append the spawn state: life sequence, health, max health, armour,
    /// armour type, selected weapon, ammo for each ammo weapon.
    pub fn write_spawn_state(&self, p: &mut Packet) {
        p.put_int(self.life_sequence)
            .put_int(self.reported_health())
            .put_int(self.max_health)
            .put_int(self.armour)
            .put_int(self.armour_type.id())
            .put_int(self.selected_weapon.id());
        for w in Weapon::AMMO_WEAPONS {
            p.put_int(self.ammo[w as usize]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(health: i32, armour: i32, armour_type: ArmourType) -> PlayerState {
        PlayerState {
            life: LifeState::Alive,
            health,
            armour,
            armour_type,
            ..PlayerState::default()
        }
    }

    #[test]
    fn test_armour_absorption() {
        let mut s = armed(100, 100, ArmourType::Green);
        s.apply_damage(40);
        assert_eq!(s.armour, 70);
        assert_eq!(s.health, 90);

        let mut s = armed(100, 100, ArmourType::Yellow);
        s.apply_damage(100);
        assert_eq!(s.armour, 15);
        assert_eq!(s.health, 85);
    }

    #[test]
    fn test_absorption_capped_by_armour() {
        let mut s = armed(100, 10, ArmourType::Blue);
        s.apply_damage(60);
        assert_eq!(s.armour, 0);
        assert_eq!(s.health, 50);

        let mut s = armed(100, 0, ArmourType::Yellow);
        s.apply_damage(30);
        assert_eq!(s.health, 70);
    }

    #[test]
    fn test_life_sequence_wraps() {
        let mut s = PlayerState::default();
        s.life_sequence = 127;
        s.begin_spawn(10);
        assert_eq!(s.life_sequence, 0);
        assert_eq!(s.last_spawn_attempt, Some(10));
    }

    #[test]
    fn test_confirm_spawn_checks_sequence() {
        let mut s = PlayerState::default();
        assert!(!s.confirm_spawn(0, Weapon::Pistol));
        s.begin_spawn(0);
        assert!(!s.confirm_spawn(s.life_sequence + 1, Weapon::Pistol));
        assert!(s.confirm_spawn(s.life_sequence, Weapon::Rifle));
        assert!(s.is_alive());
        assert_eq!(s.selected_weapon, Weapon::Rifle);
        // A second confirmation for the same life is rejected.
        assert!(!s.confirm_spawn(s.life_sequence, Weapon::Rifle));
    }

    #[test]
    fn test_try_shoot_books_ammo_and_reload() {
        let mut s = armed(100, 0, ArmourType::Blue);
        s.ammo[Weapon::Rifle as usize] = 2;
        s.ammo[Weapon::Fist as usize] = 1;

        assert!(s.try_shoot(Weapon::Rifle, 1000));
        assert_eq!(s.ammo[Weapon::Rifle as usize], 1);
        assert_eq!(s.damage_potential, 100);
        assert!(!s.try_shoot(Weapon::Rifle, 1500));
        assert!(s.try_shoot(Weapon::Rifle, 2500));
        assert!(!s.try_shoot(Weapon::Rifle, 5000));

        assert!(s.try_shoot(Weapon::Fist, 5000));
        assert!(s.try_shoot(Weapon::Fist, 5250));
        assert_eq!(s.ammo[Weapon::Fist as usize], 1);
    }

    #[test]
    fn test_dead_cannot_shoot_or_switch() {
        let mut s = PlayerState::default();
        s.ammo[Weapon::Pistol as usize] = 10;
        assert!(!s.try_shoot(Weapon::Pistol, 0));
        assert!(!s.select_weapon(Weapon::Pistol));
    }

    #[test]
    fn test_reset_for_map_clears_scores() {
        let mut s = armed(50, 0, ArmourType::Blue);
        s.frags = 4;
        s.flags = 2;
        s.life_sequence = 9;
        s.reset_for_map();
        assert_eq!(s.frags, 0);
        assert_eq!(s.flags, 0);
        assert_eq!(s.life_sequence, 0);
        assert_eq!(s.max_health, DEFAULT_MAX_HEALTH);
    }

    #[test]
    fn test_spawn_state_layout() {
        let mut s = armed(100, 25, ArmourType::Blue);
        s.life_sequence = 3;
        s.ammo[Weapon::Pistol as usize] = 40;
        let mut p = Packet::new();
        s.write_spawn_state(&mut p);
        assert_eq!(p.as_bytes(), &[3, 100, 100, 25, 0, 6, 0, 0, 0, 0, 0, 40]);
    }
}
