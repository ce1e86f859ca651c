//! Network Layer
//!
//! Everything that talks to the outside: the datagram transport, the wire
//! protocol, client slots, the relay, bans, the master server link, server
//! info queries and the server loop that ties them together.

pub mod bans;
pub mod client;
pub mod clients;
pub mod extinfo;
pub mod handlers;
pub mod master;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;

pub use bans::{Ban, BanError, BanManager, Ipv4Net};
pub use client::Client;
pub use clients::ClientManager;
pub use master::{MasterEvent, MasterLink, MasterReply};
pub use protocol::{DisconnectReason, MasterMode, Msg, Role};
pub use relay::Relay;
pub use server::{GameServer, GameServerError, ServerState};
pub use transport::{Host, HostEvent, PeerId, UdpHost};
