//! Client Manager
//!
//! Owns the client slots and every fan-out path to them.
//!
//! ## Slots
//!
//! ```text
//!   connect A, B, C      [A:0] [B:1] [C:2]
//!   disconnect B         [A:0] [ - ] [C:2]    slot 1 kept, in_use = false
//!   connect D            [A:0] [D:1] [C:2]    first free slot reused
//! ```
//!
//! Client numbers therefore always form a prefix of the non-negative
//! integers. A rebound slot gets a fresh session id so that results of
//! work started for the previous occupant can be told apart.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::core::packet::Packet;
use crate::game::mode::GameMode;
use crate::network::client::Client;
use crate::network::protocol::{color, DisconnectReason, MasterMode, Msg, MESSAGE_CHANNEL};
use crate::network::relay::{Relay, Sender};
use crate::network::transport::{Host, PeerId};

/// What a disconnect left behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Departure {
    /// The client had joined the game.
    pub was_joined: bool,
    /// The client held the last privileged role.
    pub unsupervised: bool,
    /// No client remains.
    pub empty: bool,
}

/// Client slots plus the transport and relay they talk through.
pub struct ClientManager {
    clients: Vec<Client>,
    host: Arc<dyn Host>,
    relay: Relay,
    max_clients: usize,
    rng: StdRng,
}

impl ClientManager {
    /// No slots yet.
    pub fn new(host: Arc<dyn Host>, relay: Relay, max_clients: usize) -> Self {
        Self {
            clients: Vec::new(),
            host,
            relay,
            max_clients,
            rng: StdRng::from_entropy(),
        }
    }

    /// Player limit.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// The relay clients publish to.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    /// Bind `peer` to the first free slot, appending one if all are taken.
    pub fn add(&mut self, peer: PeerId, addr: SocketAddr) -> u32 {
        let index = match self.clients.iter().position(|c| !c.in_use) {
            Some(i) => i,
            None => {
                self.clients.push(Client::new(self.clients.len() as u32));
                self.clients.len() - 1
            }
        };
        let previous = self.clients[index].session_id;
        let session_id = loop {
            let id = self.rng.gen_range(0..1u32 << 31);
            if id != previous {
                break id;
            }
        };
        let cn = self.clients[index].cn;
        self.clients[index].bind(peer, addr, session_id);
        debug!(cn, ?peer, %addr, "client slot bound");
        cn
    }

    /// Register a joining client with the relay. Clients only see relayed
    /// positions and client frames once they are in the game.
    pub fn enter_relay(&mut self, cn: u32) -> bool {
        let Some(client) = self.clients.get_mut(cn as usize).filter(|c| c.in_use) else {
            return false;
        };
        let Some(peer) = client.peer else { return false };
        let host = Arc::clone(&self.host);
        let sender: Sender = Box::new(move |channel, data: &[u8], reliable| {
            host.send(peer, channel, data, reliable);
        });
        match self.relay.add(cn, sender) {
            Some((positions, frames)) => {
                client.attach_relay(positions, frames);
                true
            }
            None => false,
        }
    }

    /// Client in slot `cn`, if bound.
    pub fn get(&self, cn: u32) -> Option<&Client> {
        self.clients.get(cn as usize).filter(|c| c.in_use)
    }

    /// Mutable client in slot `cn`, if bound.
    pub fn get_mut(&mut self, cn: u32) -> Option<&mut Client> {
        self.clients.get_mut(cn as usize).filter(|c| c.in_use)
    }

    /// Slot bound to `peer`.
    pub fn by_peer(&self, peer: PeerId) -> Option<u32> {
        self.iter().find(|c| c.peer == Some(peer)).map(|c| c.cn)
    }

    /// Bound clients.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().filter(|c| c.in_use)
    }

    /// Bound clients, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.iter_mut().filter(|c| c.in_use)
    }

    /// Clients that completed the handshake.
    pub fn joined(&self) -> impl Iterator<Item = &Client> {
        self.iter().filter(|c| c.joined)
    }

    /// Number of bound clients.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True if no slot is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever created.
    pub fn slot_count(&self) -> usize {
        self.clients.len()
    }

    /// True if the player limit is reached.
    pub fn is_full(&self) -> bool {
        self.joined().count() >= self.max_clients
    }

    /// True if any bound client holds a role.
    pub fn has_privileged(&self) -> bool {
        self.iter().any(|c| c.role.is_privileged())
    }

    /// Client name, disambiguated with its number when another client has
    /// the same one.
    pub fn unique_name(&self, cn: u32) -> String {
        let Some(client) = self.get(cn) else {
            return String::new();
        };
        let duplicate = self
            .iter()
            .any(|c| c.cn != cn && c.name == client.name);
        if duplicate {
            format!(
                "{} {}{}({}){}",
                client.name,
                color::SAVE,
                color::MAGENTA,
                cn,
                color::RESTORE
            )
        } else {
            client.name.clone()
        }
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Send to one client.
    pub fn send(&self, cn: u32, channel: u8, reliable: bool, p: &Packet) {
        if let Some(peer) = self.get(cn).and_then(|c| c.peer) {
            self.host.send(peer, channel, p.as_bytes(), reliable);
        }
    }

    /// Send to every joined client except `exclude`.
    pub fn broadcast(&self, exclude: Option<u32>, channel: u8, reliable: bool, p: &Packet) {
        for c in self.joined().filter(|c| Some(c.cn) != exclude) {
            if let Some(peer) = c.peer {
                self.host.send(peer, channel, p.as_bytes(), reliable);
            }
        }
    }

    /// Reliable broadcast to everyone but `from`.
    pub fn relay_from(&self, from: u32, p: &Packet) {
        self.broadcast(Some(from), MESSAGE_CHANNEL, true, p);
    }

    /// Reliable send to `cn`'s team mates.
    pub fn send_to_team(&self, cn: u32, p: &Packet) {
        let Some(team) = self.get(cn).map(|c| c.team.as_str()).filter(|t| !t.is_empty()) else {
            return;
        };
        for c in self.joined().filter(|c| c.cn != cn && c.team == team) {
            if let Some(peer) = c.peer {
                self.host.send(peer, MESSAGE_CHANNEL, p.as_bytes(), true);
            }
        }
    }

    /// Chat-style server message to one client.
    pub fn send_server_message(&self, cn: u32, text: &str) {
        self.send(cn, MESSAGE_CHANNEL, true, &server_message(text));
    }

    /// Chat-style server message to everyone.
    pub fn broadcast_server_message(&self, text: &str) {
        self.broadcast(None, MESSAGE_CHANNEL, true, &server_message(text));
    }

    // -------------------------------------------------------------------------
    // Handshake packets
    // -------------------------------------------------------------------------

    /// `CurrentMaster(mastermode, (cn, role)*, -1)`.
    pub fn masters_packet(&self, mastermode: MasterMode) -> Packet {
        let mut p = Packet::new();
        p.put_int(Msg::CurrentMaster.code()).put_int(mastermode.code());
        for c in self.iter().filter(|c| c.role.is_privileged()) {
            p.put_int(c.cn as i32).put_int(c.role.code());
        }
        p.put_int(-1);
        p
    }

    /// Everything a freshly joined client needs, as one frame.
    pub fn welcome_packet(&self, cn: u32, map: &str, mode: &GameMode, mastermode: MasterMode) -> Packet {
        let mut p = Packet::with_capacity(256);
        p.put_int(Msg::Welcome.code());
        p.put_int(Msg::MapChange.code())
            .put_string(map)
            .put_int(mode.id().0)
            .put_bool(mode.needs_map_info());
        p.put_int(Msg::TimeLeft.code())
            .put_int(mode.time_left().as_secs() as i32);
        if mode.is_paused() {
            p.put_int(Msg::PauseGame.code()).put_bool(true).put_int(-1);
        }
        p.put_packet(&self.masters_packet(mastermode));

        if let Some(c) = self.get(cn) {
            p.put_int(Msg::SetTeam.code())
                .put_int(cn as i32)
                .put_string(&c.team)
                .put_int(-1);
            if c.state.is_spectator() {
                p.put_int(Msg::Spectator.code()).put_int(cn as i32).put_bool(true);
            } else {
                p.put_int(Msg::SpawnState.code()).put_int(cn as i32);
                c.state.write_spawn_state(&mut p);
            }
        }

        let others: Vec<&Client> = self.joined().filter(|c| c.cn != cn).collect();
        p.put_int(Msg::Resume.code());
        for c in &others {
            c.write_resume_entry(&mut p);
        }
        p.put_int(-1);
        for c in &others {
            c.write_init(&mut p);
        }
        mode.write_init(&mut p);
        p
    }

    // -------------------------------------------------------------------------
    // Disconnect
    // -------------------------------------------------------------------------

    /// Drop a client: tell the others, tell the transport, free the slot.
    /// `None` if the slot was not in use.
    pub fn disconnect(&mut self, cn: u32, reason: DisconnectReason) -> Option<Departure> {
        let client = self.get(cn)?;
        let was_joined = client.joined;
        let was_privileged = client.role.is_privileged();
        let peer = client.peer;
        let name = self.unique_name(cn);

        if was_joined {
            let mut p = Packet::new();
            p.put_int(Msg::Leave.code()).put_int(cn as i32);
            self.broadcast(Some(cn), MESSAGE_CHANNEL, true, &p);
        }
        if reason != DisconnectReason::None {
            self.broadcast_server_message(&format!(
                "client {} disconnected because: {}",
                name,
                reason.message()
            ));
        }
        if let Some(peer) = peer {
            self.host.disconnect(peer, reason);
        }
        self.relay.remove(cn);
        if let Some(c) = self.clients.get_mut(cn as usize) {
            c.reset();
        }
        info!(cn, name = %name, reason = ?reason, "client disconnected");

        Some(Departure {
            was_joined,
            unsupervised: was_privileged && !self.has_privileged(),
            empty: self.is_empty(),
        })
    }
}

/// `ServerMessage(text)`.
pub fn server_message(text: &str) -> Packet {
    let mut p = Packet::new();
    p.put_int(Msg::ServerMessage.code()).put_string(text);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mode::{ModeId, ModeSettings};
    use crate::game::state::LifeState;
    use crate::network::protocol::Role;
    use crate::network::transport::testing::RecordingHost;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 5000))
    }

    fn manager() -> (ClientManager, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        (ClientManager::new(host.clone(), Relay::new(), 8), host)
    }

    fn join(m: &mut ClientManager, peer: u64, name: &str) -> u32 {
        let cn = m.add(PeerId(peer), addr(peer as u8));
        let c = m.get_mut(cn).unwrap();
        c.joined = true;
        c.name = name.into();
        assert!(m.enter_relay(cn));
        cn
    }

    #[test]
    fn test_slot_reuse() {
        let (mut m, _) = manager();
        let a = m.add(PeerId(1), addr(1));
        let b = m.add(PeerId(2), addr(2));
        let c = m.add(PeerId(3), addr(3));
        assert_eq!((a, b, c), (0, 1, 2));
        let old_session = m.get(1).unwrap().session_id;

        m.disconnect(b, DisconnectReason::None);
        assert!(m.get(1).is_none());
        assert_eq!(m.slot_count(), 3);

        let d = m.add(PeerId(4), addr(4));
        assert_eq!(d, 1);
        assert_ne!(m.get(1).unwrap().session_id, old_session);
        assert_eq!(m.by_peer(PeerId(4)), Some(1));
        assert!(m.get(1).unwrap().session_id < 1 << 31);
    }

    #[test]
    fn test_slots_form_prefix() {
        let (mut m, _) = manager();
        for p in 0..5 {
            m.add(PeerId(p), addr(p as u8));
        }
        for cn in [3, 0, 4] {
            m.disconnect(cn, DisconnectReason::None);
        }
        m.add(PeerId(10), addr(10));
        let slots: Vec<u32> = m.clients.iter().map(|c| c.cn).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert_eq!(m.len(), 3);
        assert!(m.get(0).is_some());
    }

    #[test]
    fn test_broadcast_reaches_joined_only() {
        let (mut m, host) = manager();
        join(&mut m, 0, "a");
        join(&mut m, 1, "b");
        m.add(PeerId(2), addr(2));
        m.broadcast_server_message("hi");
        assert_eq!(host.sent_to(PeerId(0)).len(), 1);
        assert_eq!(host.sent_to(PeerId(1)).len(), 1);
        assert!(host.sent_to(PeerId(2)).is_empty());

        host.clear();
        m.relay_from(0, &server_message("x"));
        assert!(host.sent_to(PeerId(0)).is_empty());
        assert_eq!(host.sent_to(PeerId(1)).len(), 1);
    }

    #[test]
    fn test_send_to_team() {
        let (mut m, host) = manager();
        for (i, team) in ["good", "good", "evil"].iter().enumerate() {
            let cn = join(&mut m, i as u64, "p");
            m.get_mut(cn).unwrap().team = team.to_string();
        }
        m.send_to_team(0, &server_message("t"));
        assert!(host.sent_to(PeerId(0)).is_empty());
        assert_eq!(host.sent_to(PeerId(1)).len(), 1);
        assert!(host.sent_to(PeerId(2)).is_empty());
    }

    #[test]
    fn test_unique_name() {
        let (mut m, _) = manager();
        join(&mut m, 0, "bob");
        join(&mut m, 1, "bob");
        join(&mut m, 2, "eve");
        assert_eq!(m.unique_name(1), "bob \u{c}s\u{c}5(1)\u{c}r");
        assert_eq!(m.unique_name(2), "eve");
    }

    #[test]
    fn test_disconnect_notifies() {
        let (mut m, host) = manager();
        join(&mut m, 0, "a");
        join(&mut m, 1, "b");
        m.get_mut(0).unwrap().role = Role::Master;

        let dep = m.disconnect(1, DisconnectReason::Kick).unwrap();
        assert!(dep.was_joined);
        assert!(!dep.unsupervised);
        assert!(!dep.empty);
        assert_eq!(host.disconnects(), vec![(PeerId(1), DisconnectReason::Kick)]);
        let to0 = host.sent_to(PeerId(0));
        assert_eq!(to0[0], vec![Msg::Leave.code() as u8, 1]);
        assert_eq!(to0.len(), 2);

        let dep = m.disconnect(0, DisconnectReason::None).unwrap();
        assert!(dep.unsupervised && dep.empty);
        assert!(m.disconnect(0, DisconnectReason::None).is_none());
    }

    #[test]
    fn test_unprivileged_leave_keeps_supervision_state() {
        let (mut m, _) = manager();
        join(&mut m, 0, "a");
        join(&mut m, 1, "b");
        let dep = m.disconnect(1, DisconnectReason::None).unwrap();
        assert!(!dep.unsupervised);
        assert!(!dep.empty);
    }

    #[test]
    fn test_relay_publishers_follow_slot() {
        let (mut m, host) = manager();
        join(&mut m, 0, "a");
        join(&mut m, 1, "b");
        m.get(0).unwrap().publish_position(&[4, 0, 9]);
        m.relay().flush();
        assert_eq!(host.sent_to(PeerId(1)), vec![vec![4, 0, 9]]);

        m.disconnect(0, DisconnectReason::None);
        host.clear();
        join(&mut m, 2, "c");
        m.get(0).unwrap().publish_position(&[4, 0, 1]);
        m.relay().flush();
        assert_eq!(host.sent_to(PeerId(1)), vec![vec![4, 0, 1]]);
    }

    #[test]
    fn test_relay_waits_for_join() {
        let (mut m, host) = manager();
        join(&mut m, 0, "a");
        let pending = m.add(PeerId(1), addr(1));
        assert!(!m.get(pending).unwrap().is_relayed());
        m.get(0).unwrap().publish_position(&[4, 0, 9]);
        m.relay().flush();
        assert!(host.sent_to(PeerId(1)).is_empty());

        assert!(m.enter_relay(pending));
        assert!(!m.enter_relay(pending));
        m.get(0).unwrap().publish_position(&[4, 0, 9]);
        m.relay().flush();
        assert_eq!(host.sent_to(PeerId(1)), vec![vec![4, 0, 9]]);
    }

    #[test]
    fn test_welcome_order() {
        let (mut m, _) = manager();
        let a = join(&mut m, 0, "a");
        let b = join(&mut m, 1, "b");
        m.get_mut(b).unwrap().state.life = LifeState::Spectator;
        let mode = GameMode::new(ModeId::FFA, &ModeSettings::default()).unwrap();

        let mut p = m.welcome_packet(a, "xy", &mode, MasterMode::Open);
        assert_eq!(p.get_int(), Some(Msg::Welcome.code()));
        assert_eq!(p.get_int(), Some(Msg::MapChange.code()));
        assert_eq!(p.get_string().as_deref(), Some("xy"));
        assert_eq!(p.get_int(), Some(0));
        assert_eq!(p.get_bool(), Some(false));
        assert_eq!(p.get_int(), Some(Msg::TimeLeft.code()));
        assert_eq!(p.get_int(), Some(600));
        assert_eq!(p.get_int(), Some(Msg::CurrentMaster.code()));
        assert_eq!(p.get_int(), Some(0));
        assert_eq!(p.get_int(), Some(-1));
        assert_eq!(p.get_int(), Some(Msg::SetTeam.code()));
        assert_eq!(p.get_int(), Some(0));
        assert_eq!(p.get_string().as_deref(), Some(""));
        assert_eq!(p.get_int(), Some(-1));
        assert_eq!(p.get_int(), Some(Msg::SpawnState.code()));
        assert_eq!(p.get_int(), Some(0));
        for _ in 0..12 {
            p.get_int().unwrap();
        }
        assert_eq!(p.get_int(), Some(Msg::Resume.code()));
        assert_eq!(p.get_int(), Some(1));
        assert_eq!(p.get_int(), Some(LifeState::Spectator.id()));
        for _ in 0..4 + 12 {
            p.get_int().unwrap();
        }
        assert_eq!(p.get_int(), Some(-1));
        assert_eq!(p.get_int(), Some(Msg::InitializeClient.code()));
        assert_eq!(p.get_int(), Some(1));
        assert_eq!(p.get_string().as_deref(), Some("b"));
        assert_eq!(p.get_string().as_deref(), Some(""));
        assert_eq!(p.get_int(), Some(0));
        assert_eq!(p.remaining(), 0);
    }
}
