//! Client Slot
//!
//! One connected (or previously connected) player. Slots are never freed:
//! a reset slot keeps its client number and is reused by the next peer.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::core::packet::Packet;
use crate::core::vec3::Vec3;
use crate::game::state::PlayerState;
use crate::network::protocol::{DisconnectReason, Msg, Role};
use crate::network::relay::{FramePublisher, PositionPublisher};
use crate::network::transport::PeerId;

/// Default player model.
pub const DEFAULT_MODEL: i32 = 0;

/// Longest accepted player name.
pub const MAX_NAME_LEN: usize = 15;

/// Name given to players who send an empty one.
pub const DEFAULT_NAME: &str = "unnamed";

/// A client slot.
pub struct Client {
    /// Client number; stable for the slot's lifetime.
    pub cn: u32,
    /// Random id, rolled each time the slot is bound.
    pub session_id: u32,
    /// Bound transport peer.
    pub peer: Option<PeerId>,
    /// Remote address of the bound peer.
    pub addr: Option<SocketAddr>,
    /// Slot is bound to a peer.
    pub in_use: bool,
    /// Client completed the join handshake.
    pub joined: bool,
    /// Display name.
    pub name: String,
    /// Team name; empty in teamless modes.
    pub team: String,
    /// Player model id.
    pub model: i32,
    /// Privilege.
    pub role: Role,
    /// Set while the client may only join after authenticating; holds the
    /// reason it is disconnected with if that fails.
    pub auth_required_because: Option<DisconnectReason>,
    /// Last reported ping (ms).
    pub ping: i32,
    /// Authenticated names by domain.
    pub auth_names: BTreeMap<String, String>,
    /// Last known position.
    pub position: Vec3,
    /// Combat state.
    pub state: PlayerState,
    positions: Option<PositionPublisher>,
    frames: Option<FramePublisher>,
}

impl Client {
    /// Empty slot.
    pub fn new(cn: u32) -> Self {
        Self {
            cn,
            session_id: 0,
            peer: None,
            addr: None,
            in_use: false,
            joined: false,
            name: String::new(),
            team: String::new(),
            model: DEFAULT_MODEL,
            role: Role::None,
            auth_required_because: None,
            ping: 0,
            auth_names: BTreeMap::new(),
            position: Vec3::ZERO,
            state: PlayerState::new(),
            positions: None,
            frames: None,
        }
    }

    /// Bind the slot to a peer.
    pub fn bind(&mut self, peer: PeerId, addr: SocketAddr, session_id: u32) {
        self.reset();
        self.peer = Some(peer);
        self.addr = Some(addr);
        self.session_id = session_id;
        self.in_use = true;
    }

    /// Install the relay publishers handed out on join.
    pub fn attach_relay(&mut self, positions: PositionPublisher, frames: FramePublisher) {
        self.positions = Some(positions);
        self.frames = Some(frames);
    }

    /// True once the client publishes into the relay.
    pub fn is_relayed(&self) -> bool {
        self.positions.is_some()
    }

    /// Clear everything but the client number.
    pub fn reset(&mut self) {
        *self = Self::new(self.cn);
    }

    /// IPv4 address of the peer, if any.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        }
    }

    /// Name authenticated in `domain`.
    pub fn auth_name(&self, domain: &str) -> Option<&str> {
        self.auth_names.get(domain).map(String::as_str)
    }

    /// Queue a position update for the relay.
    pub fn publish_position(&self, payload: &[u8]) {
        if let Some(p) = &self.positions {
            p.publish(payload);
        }
    }

    /// Queue a message relayed to the other clients as a client frame.
    pub fn publish_frame(&self, payload: &[u8]) {
        if let Some(f) = &self.frames {
            f.publish(payload);
        }
    }

    /// `InitializeClient(cn, name, team, model)`.
    pub fn write_init(&self, p: &mut Packet) {
        p.put_int(Msg::InitializeClient.code())
            .put_int(self.cn as i32)
            .put_string(&self.name)
            .put_string(&self.team)
            .put_int(self.model);
    }

    /// Resume entry: cn, state, frags, flags, deaths, quad, spawn state.
    pub fn write_resume_entry(&self, p: &mut Packet) {
        p.put_int(self.cn as i32)
            .put_int(self.state.life.id())
            .put_int(self.state.frags)
            .put_int(self.state.flags)
            .put_int(self.state.deaths)
            .put_int(self.state.quad_time_left);
        self.state.write_spawn_state(p);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cn", &self.cn)
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("in_use", &self.in_use)
            .field("joined", &self.joined)
            .field("name", &self.name)
            .field("team", &self.team)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Sanitize a requested player name.
pub fn sanitize_name(name: &str) -> String {
    let filtered = crate::core::cubecode::filter_text(name, false);
    let trimmed: String = filtered.trim().chars().take(MAX_NAME_LEN).collect();
    if trimmed.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        trimmed
    }
}
