//! Game Logic Module
//!
//! Rules of play: player state, weapons, modes and their fragments, the
//! match clock and the map rotation.
//!
//! ## Module Structure
//!
//! - `state`: Per-player combat state
//! - `weapon`: Static weapon table
//! - `combat`: Shot and explosion validation, damage
//! - `kit`: Spawn loadouts
//! - `team`: Team affiliation and balancing
//! - `clock`: Pausable match clock
//! - `ctf`: Flag rules
//! - `mode`: Mode assembly and the competitive policy
//! - `rotation`: Map pools and queue

pub mod clock;
pub mod combat;
pub mod ctf;
pub mod kit;
pub mod mode;
pub mod rotation;
pub mod state;
pub mod team;
pub mod weapon;

// Re-export key types
pub use clock::Clock;
pub use mode::{GameMode, GameTimer, ModeCtx, ModeEvent, ModeId, ModeSettings};
pub use rotation::{MapPools, MapRotation};
pub use state::{LifeState, PlayerState};
pub use weapon::Weapon;
