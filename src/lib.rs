//! # Sauer Server
//!
//! Dedicated server for Cube 2: Sauerbraten clients (protocol 259).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SAUER SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── packet.rs   - Variable-length integer codec             │
//! │  ├── cubecode.rs - Cube text encoding                        │
//! │  ├── vec3.rs     - Positions and directions                  │
//! │  └── timer.rs    - Pausable tickers, timers, timer queue     │
//! │                                                              │
//! │  game/           - Rules of play                             │
//! │  ├── state.rs    - Player combat state                       │
//! │  ├── combat.rs   - Shot and explosion damage                 │
//! │  ├── mode.rs     - Modes, teams, flags, competitive policy   │
//! │  └── rotation.rs - Map pools and queue                       │
//! │                                                              │
//! │  auth/           - Challenge/response authentication         │
//! │                                                              │
//! │  network/        - Transport, relay, bans, master link       │
//! │  ├── server.rs   - Server loop and game flow                 │
//! │  └── handlers.rs - Client message dispatch                   │
//! │                                                              │
//! │  config.rs       - JSON config with SAUER_* overrides        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All game state is owned by one task. Side tasks (transport, master
//! links, relay flush) hand results back over channels; results meant for
//! a client are dropped if the client's slot has changed hands since.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig};
pub use core::packet::Packet;
pub use game::mode::{GameMode, ModeId};
pub use network::protocol::PROTOCOL_VERSION;
pub use network::server::{GameServer, GameServerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
