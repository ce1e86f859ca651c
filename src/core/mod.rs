//! Core primitives.
//!
//! Wire codec, text encoding, vector math and the pausable time sources the
//! game layer is built on. Nothing here knows about clients or modes.

pub mod cubecode;
pub mod packet;
pub mod timer;
pub mod vec3;

// Re-export core types
pub use packet::Packet;
pub use timer::{Ticker, Timer, TimerQueue};
pub use vec3::{Vec3, DMF, DNF};
