//! Client Message Dispatch
//!
//! A datagram is a run of messages, each led by its code. Messages are
//! consumed left to right; a short or unknown message ends the datagram,
//! a message the client may not send ends the client.

use tracing::{debug, info, warn};

use crate::core::cubecode::filter_text;
use crate::core::packet::Packet;
use crate::core::vec3::{Vec3, DMF};
use crate::game::combat::{Explosion, Shot};
use crate::game::mode::{ModeCtx, ModeId};
use crate::game::state::LifeState;
use crate::game::weapon::Weapon;
use crate::network::client::sanitize_name;
use crate::network::protocol::{color, DisconnectReason, MasterMode, Msg, Role, MESSAGE_CHANNEL};
use crate::network::server::{mode_ctx, ServerState};

/// `SetTeam` reason shown as "switched to team".
pub const TEAM_SWITCHED: i32 = 0;

/// `SetTeam` reason shown as "forced to team".
pub const TEAM_FORCED: i32 = 1;

/// Decode the sender cn and position of a position update. The update runs
/// to the end of the datagram and is consumed whole.
fn read_position(p: &mut Packet) -> Option<(u32, Vec3)> {
    let cn = p.get_uint()?;
    p.get_byte()?;
    let flags = p.get_uint()?;
    let mut o = [0i32; 3];
    for (k, c) in o.iter_mut().enumerate() {
        let mut v = p.get_byte()? as i32 | (p.get_byte()? as i32) << 8;
        if flags & (1 << k) != 0 {
            v |= (p.get_byte()? as i32) << 16;
            if v & 0x80_0000 != 0 {
                v |= !0xFF_FFFF;
            }
        } else if v & 0x8000 != 0 {
            v |= !0xFFFF;
        }
        *c = v;
    }
    let rest = p.remaining();
    p.get_bytes(rest)?;
    Some((cn, Vec3::from_wire(o, DMF)))
}

impl ServerState {
    /// Process one datagram from `cn`.
    pub(crate) fn handle_packet(&mut self, cn: u32, channel: u8, p: &mut Packet) {
        let Some(session) = self.clients.get(cn).map(|c| c.session_id) else { return };
        while p.remaining() > 0 {
            let start = p.position();
            let Some(code) = p.get_int() else { break };
            let Some(msg) = Msg::from_code(code) else {
                debug!(cn, code, channel, "unknown message code");
                break;
            };
            let joined = self.clients.get(cn).map_or(false, |c| c.joined);
            if !msg.permitted(joined) {
                warn!(cn, ?msg, joined, "message not permitted");
                self.disconnect(cn, DisconnectReason::MessageError);
                return;
            }
            match self.handle_message(cn, msg, start, p) {
                Some(true) => {}
                Some(false) => {
                    debug!(cn, ?msg, "unhandled message");
                    break;
                }
                None => {
                    debug!(cn, ?msg, "short message");
                    break;
                }
            }
            if !self.is_session(cn, session) {
                break;
            }
        }
    }

    /// `Some(true)` once handled, `Some(false)` for messages this server
    /// does not implement, `None` on a short read.
    fn handle_message(&mut self, cn: u32, msg: Msg, start: usize, p: &mut Packet) -> Option<bool> {
        match msg {
            Msg::Join => {
                let name = p.get_string()?;
                let model = p.get_int()?;
                p.get_string()?;
                let auth_domain = p.get_string()?;
                let auth_name = p.get_string()?;
                self.request_join(cn, &name, model, &auth_domain, &auth_name);
            }
            Msg::AuthTry => {
                let domain = p.get_string()?;
                let name = p.get_string()?;
                self.start_auth(cn, &domain, &name);
            }
            Msg::AuthAnswer => {
                let domain = p.get_string()?;
                let req_id = p.get_int()?;
                let answer = p.get_string()?;
                self.confirm_auth(cn, &domain, req_id as u32, &answer);
            }
            Msg::Ping => {
                let id = p.get_int()?;
                let mut pong = Packet::new();
                pong.put_int(Msg::Pong.code()).put_int(id);
                self.clients.send(cn, MESSAGE_CHANNEL, false, &pong);
            }
            Msg::ClientPing => {
                let ping = p.get_int()?;
                if let Some(c) = self.clients.get_mut(cn) {
                    c.ping = ping;
                }
                self.publish_frame(cn, |f| {
                    f.put_int(Msg::ClientPing.code()).put_int(ping);
                });
            }
            Msg::Position => {
                let (sender, position) = read_position(p)?;
                if sender != cn {
                    debug!(cn, sender, "position for another client");
                    return Some(true);
                }
                if let Some(c) = self.clients.get_mut(cn).filter(|c| c.state.is_alive()) {
                    c.position = position;
                    c.publish_position(p.slice_from(start));
                }
            }
            Msg::ChatMessage => {
                let text = filter_text(&p.get_string()?, true);
                if let Some(c) = self.clients.get(cn) {
                    info!("{}: {}", c.name, text);
                }
                self.publish_frame(cn, |f| {
                    f.put_int(Msg::ChatMessage.code()).put_string(&text);
                });
            }
            Msg::TeamChatMessage => {
                let text = filter_text(&p.get_string()?, true);
                let Some(c) = self.clients.get(cn) else { return Some(true) };
                if c.state.is_spectator() || !self.mode.id().is_teamed() {
                    return Some(true);
                }
                let mut out = Packet::new();
                out.put_int(Msg::TeamChatMessage.code())
                    .put_int(cn as i32)
                    .put_string(&text);
                self.clients.send_to_team(cn, &out);
            }
            Msg::Sound => {
                let sound = p.get_int()?;
                self.publish_frame(cn, |f| {
                    f.put_int(Msg::Sound.code()).put_int(sound);
                });
            }
            Msg::Taunt => {
                if self.clients.get(cn).map_or(false, |c| c.state.is_alive()) {
                    self.publish_frame(cn, |f| {
                        f.put_int(Msg::Taunt.code());
                    });
                }
            }
            Msg::ChangeWeapon => {
                let gun = p.get_int()?;
                let Some(weapon) = Weapon::from_id(gun) else { return Some(true) };
                let selected = self
                    .clients
                    .get_mut(cn)
                    .map_or(false, |c| c.state.select_weapon(weapon));
                if selected {
                    self.publish_frame(cn, |f| {
                        f.put_int(Msg::ChangeWeapon.code()).put_int(weapon.id());
                    });
                }
            }
            Msg::TrySpawn => self.try_spawn(cn),
            Msg::Spawn => {
                let life_sequence = p.get_int()?;
                let gun = p.get_int()?;
                self.confirm_spawn(cn, life_sequence, gun);
            }
            Msg::Suicide => {
                if self.clients.get(cn).map_or(false, |c| c.state.is_alive()) {
                    self.kill(cn, cn);
                }
            }
            Msg::Shoot => {
                if let Some(shot) = Shot::read(p)? {
                    self.shoot(cn, shot);
                }
            }
            Msg::Explode => {
                if let Some(explosion) = Explosion::read(p)? {
                    self.explode(cn, explosion);
                }
            }
            Msg::ItemList => loop {
                if p.get_int()? < 0 {
                    break;
                }
                p.get_int()?;
            },
            Msg::MapCrc => {
                let map = p.get_string()?;
                let crc = p.get_int()?;
                debug!(cn, map = %map, crc, "map crc");
            }
            Msg::SwitchName => {
                let name = sanitize_name(&p.get_string()?);
                let Some(c) = self.clients.get_mut(cn) else { return Some(true) };
                info!("{} is now known as {}", c.name, name);
                c.name = name.clone();
                self.publish_frame(cn, |f| {
                    f.put_int(Msg::SwitchName.code()).put_string(&name);
                });
            }
            Msg::SwitchModel => {
                let model = p.get_int()?;
                if let Some(c) = self.clients.get_mut(cn) {
                    c.model = model;
                }
                self.publish_frame(cn, |f| {
                    f.put_int(Msg::SwitchModel.code()).put_int(model);
                });
            }
            Msg::SwitchTeam => {
                let team = filter_text(&p.get_string()?, false);
                if !self.change_team(cn, &team, TEAM_SWITCHED) {
                    self.resend_team(cn);
                }
            }
            Msg::SetTeam => {
                let target = p.get_int()? as u32;
                let team = filter_text(&p.get_string()?, false);
                if self.require_privilege(cn, "change teams") {
                    self.change_team(target, &team, TEAM_FORCED);
                }
            }
            Msg::Spectator => {
                let target = p.get_int()? as u32;
                let spectate = p.get_bool()?;
                self.set_spectator(cn, target, spectate);
            }
            Msg::SetMaster => {
                let target = p.get_int()? as u32;
                let claim = p.get_bool()?;
                p.get_string()?;
                self.request_role(cn, target, claim);
            }
            Msg::MasterMode => {
                let code = p.get_int()?;
                self.request_mastermode(cn, code);
            }
            Msg::Kick => {
                let victim = p.get_int()? as u32;
                let reason = filter_text(&p.get_string()?, false);
                self.kick(cn, victim, &reason);
            }
            Msg::ClearBans => {
                if self.require_privilege(cn, "clear bans") {
                    self.bans.clear_domain("");
                    self.clients.broadcast_server_message("cleared all bans");
                    info!("Client {} cleared all bans", cn);
                }
            }
            Msg::PauseGame => {
                let pause = p.get_bool()?;
                if self.require_privilege(cn, "pause the game") {
                    if pause {
                        self.mode.pause(&mut mode_ctx!(self), Some(cn));
                    } else {
                        self.mode.resume(&mut mode_ctx!(self), Some(cn));
                    }
                    self.process_mode_events();
                }
            }
            Msg::MapVote => {
                let map = filter_text(&p.get_string()?, false);
                let mode = ModeId(p.get_int()?);
                self.vote_map(cn, &map, mode);
            }
            Msg::ForceIntermission => {
                if self.require_privilege(cn, "force intermission") {
                    self.intermission();
                }
            }
            Msg::TakeFlag | Msg::TryDropFlag | Msg::InitFlags => {
                let handled = self.mode.handle_packet(&mut mode_ctx!(self), cn, msg, p)?;
                self.process_mode_events();
                return Some(handled);
            }
            _ => return Some(false),
        }
        Some(true)
    }

    /// Relay a message from `cn` to the others as a client frame.
    fn publish_frame(&self, cn: u32, build: impl FnOnce(&mut Packet)) {
        let Some(c) = self.clients.get(cn) else { return };
        let mut p = Packet::new();
        build(&mut p);
        c.publish_frame(p.as_bytes());
    }

    fn is_privileged(&self, cn: u32) -> bool {
        self.clients.get(cn).map_or(false, |c| c.role.is_privileged())
    }

    /// True if `cn` holds a role; tells them off otherwise.
    fn require_privilege(&self, cn: u32, action: &str) -> bool {
        if self.is_privileged(cn) {
            return true;
        }
        self.clients
            .send_server_message(cn, &format!("{}you need privileges to {}", color::RED, action));
        false
    }

    // -------------------------------------------------------------------------
    // Spawning
    // -------------------------------------------------------------------------

    fn try_spawn(&mut self, cn: u32) {
        let Some(c) = self.clients.get(cn) else { return };
        let clock = self.mode.clock();
        if c.state.life != LifeState::Dead
            || c.state.last_spawn_attempt.is_some()
            || !clock.is_running()
            || clock.is_paused()
            || !self.mode.can_spawn(c)
        {
            return;
        }
        self.spawn(cn);
    }

    fn confirm_spawn(&mut self, cn: u32, life_sequence: i32, gun: i32) {
        let Some(weapon) = Weapon::from_id(gun) else { return };
        let Some(c) = self.clients.get_mut(cn) else { return };
        if !c.state.confirm_spawn(life_sequence, weapon) {
            debug!(cn, life_sequence, "stale spawn");
            return;
        }
        self.mode.confirm_spawn(&mut mode_ctx!(self), cn);
        let Some(c) = self.clients.get(cn) else { return };
        let mut p = Packet::new();
        p.put_int(Msg::Spawn.code());
        c.state.write_spawn_state(&mut p);
        c.publish_frame(p.as_bytes());
    }

    // -------------------------------------------------------------------------
    // Teams and spectators
    // -------------------------------------------------------------------------

    /// Move `cn` to `team` and announce it. Switching while alive counts as
    /// a suicide.
    pub fn change_team(&mut self, cn: u32, team: &str, reason: i32) -> bool {
        let Some(c) = self.clients.get(cn).filter(|c| c.joined) else { return false };
        if c.team == team || c.state.is_spectator() || self.mode.teams().get(team).is_none() {
            return false;
        }
        if c.state.is_alive() {
            self.kill(cn, cn);
        }
        if !self.mode.change_team(&mut mode_ctx!(self), cn, team) {
            return false;
        }
        self.process_mode_events();
        let mut p = Packet::new();
        p.put_int(Msg::SetTeam.code())
            .put_int(cn as i32)
            .put_string(team)
            .put_int(reason);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        true
    }

    fn resend_team(&self, cn: u32) {
        let Some(c) = self.clients.get(cn) else { return };
        let mut p = Packet::new();
        p.put_int(Msg::SetTeam.code())
            .put_int(cn as i32)
            .put_string(&c.team)
            .put_int(-1);
        self.clients.send(cn, MESSAGE_CHANNEL, true, &p);
    }

    fn set_spectator(&mut self, cn: u32, target: u32, spectate: bool) {
        if target != cn && !self.require_privilege(cn, "move other players") {
            return;
        }
        let Some(t) = self.clients.get(target).filter(|c| c.joined) else { return };
        if t.state.is_spectator() == spectate {
            return;
        }

        if spectate {
            if t.state.is_alive() {
                self.kill(target, target);
            }
            self.mode.spectate(&mut mode_ctx!(self), target);
            if let Some(t) = self.clients.get_mut(target) {
                t.state.life = LifeState::Spectator;
                t.state.last_spawn_attempt = None;
            }
        } else {
            if self.mastermode >= MasterMode::Locked && !self.is_privileged(cn) {
                self.clients
                    .send_server_message(cn, &format!("{}the server is locked", color::RED));
                return;
            }
            if let Some(t) = self.clients.get_mut(target) {
                t.state.reset_for_spawn();
                t.state.life = LifeState::Dead;
            }
            self.mode.join(&mut mode_ctx!(self), target);
        }
        self.process_mode_events();

        let mut p = Packet::new();
        p.put_int(Msg::Spectator.code())
            .put_int(target as i32)
            .put_bool(spectate);
        if let Some(t) = self.clients.get(target).filter(|t| !spectate && !t.team.is_empty()) {
            p.put_int(Msg::SetTeam.code())
                .put_int(target as i32)
                .put_string(&t.team)
                .put_int(-1);
        }
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
    }

    // -------------------------------------------------------------------------
    // Privileges
    // -------------------------------------------------------------------------

    fn request_role(&mut self, cn: u32, target: u32, claim: bool) {
        let Some(actor) = self.clients.get(cn).map(|c| c.role) else { return };
        let Some(current) = self.clients.get(target).filter(|c| c.joined).map(|c| c.role) else {
            return;
        };

        if target == cn {
            if !claim {
                self.set_role(cn, Role::None);
            } else if actor.is_privileged() {
                return;
            } else if self.clients.has_privileged() || self.mastermode == MasterMode::Auth {
                self.clients
                    .send_server_message(cn, &format!("{}master is already claimed", color::RED));
            } else {
                self.set_role(cn, Role::Master);
            }
            return;
        }

        if claim {
            if actor < Role::Auth {
                self.clients
                    .send_server_message(cn, &format!("{}you cannot hand out master", color::RED));
            } else if current < Role::Master {
                self.set_role(target, Role::Master);
            }
        } else if actor > current {
            self.set_role(target, Role::None);
        } else {
            self.clients
                .send_server_message(cn, &format!("{}you cannot take that privilege", color::RED));
        }
    }

    fn request_mastermode(&mut self, cn: u32, code: i32) {
        if !self.require_privilege(cn, "change the mastermode") {
            return;
        }
        match MasterMode::from_code(code) {
            Some(mm @ (MasterMode::Veto | MasterMode::Locked | MasterMode::Private)) => {
                if mm == self.mastermode {
                    return;
                }
                self.mastermode = mm;
                info!("Client {} set mastermode {}", cn, mm.name());
                self.clients
                    .broadcast_server_message(&format!("mastermode is now {} ({})", mm.name(), mm.code()));
                let p = self.clients.masters_packet(self.mastermode);
                self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
            }
            _ => self
                .clients
                .send_server_message(cn, &format!("{}mastermode {} is not supported", color::RED, code)),
        }
    }

    fn kick(&mut self, cn: u32, victim: u32, reason: &str) {
        if !self.require_privilege(cn, "kick players") || victim == cn {
            return;
        }
        let Some(actor) = self.clients.get(cn).map(|c| c.role) else { return };
        let Some(target) = self.clients.get(victim).map(|c| c.role) else { return };
        if target >= actor {
            self.clients
                .send_server_message(cn, &format!("{}you cannot kick that player", color::RED));
            return;
        }
        let actor_name = self.clients.unique_name(cn);
        let victim_name = self.clients.unique_name(victim);
        let text = if reason.is_empty() {
            format!("{} kicked {}", actor_name, victim_name)
        } else {
            format!("{} kicked {} because: {}", actor_name, victim_name, reason)
        };
        info!("{}", text);
        self.clients.broadcast_server_message(&text);
        self.ban_client(victim, &format!("kicked by {}", actor_name));
        self.disconnect(victim, DisconnectReason::Kick);
    }

    // -------------------------------------------------------------------------
    // Map votes
    // -------------------------------------------------------------------------

    fn vote_map(&mut self, cn: u32, map: &str, mode: ModeId) {
        if map.is_empty() || !mode.is_supported() {
            self.clients
                .send_server_message(cn, &format!("{}cannot play {} in mode {}", color::RED, map, mode));
            return;
        }
        let name = self.clients.unique_name(cn);

        if self.is_privileged(cn) {
            self.clients
                .broadcast_server_message(&format!("{} forced {} on {}", name, mode, map));
            self.start_game(mode, map);
            return;
        }
        if self.mastermode >= MasterMode::Veto {
            self.clients
                .send_server_message(cn, &format!("{}map votes need a master", color::RED));
            return;
        }
        if mode != self.mode.id() {
            self.clients
                .send_server_message(cn, &format!("{}only maps for {} can be queued", color::RED, self.mode.id()));
            return;
        }
        match self.rotation.queue_map(mode, map) {
            Ok(()) => self
                .clients
                .broadcast_server_message(&format!("{} queued {}", name, map)),
            Err(e) => self
                .clients
                .send_server_message(cn, &format!("{}{}", color::RED, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::protocol::POSITION_CHANNEL;
    use crate::network::server::testing::TestServer;
    use crate::network::transport::PeerId;

    fn packet(build: impl FnOnce(&mut Packet)) -> Packet {
        let mut p = Packet::new();
        build(&mut p);
        p
    }

    fn admin_and_player() -> TestServer {
        let mut t = TestServer::insta();
        t.join_alive(0, "alice");
        t.join_alive(1, "bob");
        t.state.clients.get_mut(0).unwrap().role = Role::Admin;
        t
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_before_join_disconnects() {
        let mut t = TestServer::insta();
        t.connect(0);
        t.receive(0, &packet(|p| {
            p.put_int(Msg::ChatMessage.code()).put_string("hi");
        }));
        assert_eq!(t.disconnects(), vec![(PeerId(0), DisconnectReason::MessageError)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_only_code_disconnects() {
        let mut t = TestServer::insta();
        t.join(0, "a");
        t.receive(0, &packet(|p| {
            p.put_int(Msg::Damage.code());
        }));
        assert_eq!(t.disconnects(), vec![(PeerId(0), DisconnectReason::MessageError)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_before_join() {
        let mut t = TestServer::insta();
        t.connect(0);
        t.receive(0, &packet(|p| {
            p.put_int(Msg::Ping.code()).put_int(7);
        }));
        let pong = t.host.sent().into_iter().last().unwrap();
        assert_eq!(pong.data, vec![31, 7]);
        assert!(!pong.reliable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_code_aborts_datagram() {
        let mut t = TestServer::insta();
        t.join(0, "a");
        t.receive(0, &packet(|p| {
            p.put_int(120).put_int(Msg::Ping.code()).put_int(5);
        }));
        assert!(!t.sent_to(0).contains(&vec![31, 5]));
        assert!(t.disconnects().is_empty());

        t.receive(0, &packet(|p| {
            p.put_int(Msg::Ping.code()).put_int(5).put_int(Msg::Ping.code()).put_int(6);
        }));
        assert!(t.sent_to(0).contains(&vec![31, 5]));
        assert!(t.sent_to(0).contains(&vec![31, 6]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_relayed_to_others() {
        let mut t = TestServer::insta();
        t.join(0, "alice");
        t.join(1, "bob");
        t.host.clear();
        t.receive(0, &packet(|p| {
            p.put_int(Msg::ChatMessage.code()).put_string("hi\u{c}3");
        }));
        t.state.clients.relay().flush();
        assert_eq!(t.sent_to(1), vec![vec![88, 0, 4, 5, b'h', b'i', 0]]);
        assert!(t.sent_to(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_skips_clients_not_joined() {
        let mut t = TestServer::insta();
        t.join(0, "alice");
        t.connect(1);
        t.host.clear();
        t.receive(0, &packet(|p| {
            p.put_int(Msg::ChatMessage.code()).put_string("hi");
        }));
        t.state.clients.relay().flush();
        assert!(t.sent_to(1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_relayed_when_alive() {
        let mut t = TestServer::insta();
        t.join(0, "alice");
        t.join_alive(1, "bob");
        let update = packet(|p| {
            p.put_int(Msg::Position.code()).put_uint(0).put_byte(0).put_uint(0);
            p.put_bytes(&[16, 0, 32, 0, 48, 0, 9, 9]);
        });
        let positions_to_bob = |t: &TestServer| {
            t.host
                .sent()
                .into_iter()
                .filter(|s| s.peer == PeerId(1) && s.channel == POSITION_CHANNEL)
                .count()
        };

        t.receive(0, &update);
        t.state.clients.relay().flush();
        assert_eq!(positions_to_bob(&t), 0);

        let ls = t.state.clients.get(0).unwrap().state.life_sequence;
        t.receive(0, &packet(|p| {
            p.put_int(Msg::Spawn.code()).put_int(ls).put_int(Weapon::Rifle.id());
        }));
        t.receive(0, &update);
        t.state.clients.relay().flush();
        let sent: Vec<_> = t
            .host
            .sent()
            .into_iter()
            .filter(|s| s.peer == PeerId(1) && s.channel == POSITION_CHANNEL)
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, update.as_bytes());
        assert_eq!(t.state.clients.get(0).unwrap().position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_read_position_sign_extends() {
        let mut p = packet(|p| {
            p.put_uint(2).put_byte(0).put_uint(0b100);
            p.put_bytes(&[0xF0, 0xFF, 0, 1, 0xF0, 0xFF, 0xFF]);
        });
        let (cn, pos) = read_position(&mut p).unwrap();
        assert_eq!(cn, 2);
        assert_eq!(pos, Vec3::new(-1.0, 16.0, -1.0));
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suicide() {
        let mut t = TestServer::insta();
        t.join_alive(0, "a");
        t.receive(0, &packet(|p| {
            p.put_int(Msg::Suicide.code());
        }));
        let s = &t.state.clients.get(0).unwrap().state;
        assert_eq!((s.frags, s.deaths), (-1, 1));
        assert!(t.sent_to(0).contains(&vec![11, 0, 0, 0xFF, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_spawn_after_death() {
        let mut t = TestServer::insta();
        t.join_alive(0, "a");
        t.receive(0, &packet(|p| {
            p.put_int(Msg::Suicide.code()).put_int(Msg::TrySpawn.code());
        }));
        let s = &t.state.clients.get(0).unwrap().state;
        assert_eq!(s.life, LifeState::Dead);
        assert!(s.last_spawn_attempt.is_some());
        assert_eq!(s.life_sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_and_relinquish_master() {
        let mut t = TestServer::insta();
        t.join(0, "alice");
        t.join(1, "bob");
        let setmaster = |cn: i32, claim: bool| {
            packet(|p| {
                p.put_int(Msg::SetMaster.code()).put_int(cn).put_bool(claim).put_string("");
            })
        };

        t.receive(0, &setmaster(0, true));
        t.receive(1, &setmaster(1, true));
        assert_eq!(t.state.clients.get(0).unwrap().role, Role::Master);
        assert_eq!(t.state.clients.get(1).unwrap().role, Role::None);

        t.receive(0, &packet(|p| {
            p.put_int(Msg::MasterMode.code()).put_int(2);
        }));
        assert_eq!(t.state.mastermode, MasterMode::Locked);
        t.receive(0, &packet(|p| {
            p.put_int(Msg::MasterMode.code()).put_int(0);
        }));
        assert_eq!(t.state.mastermode, MasterMode::Locked);

        t.receive(1, &setmaster(0, false));
        assert_eq!(t.state.clients.get(0).unwrap().role, Role::Master);
        t.receive(0, &setmaster(0, false));
        assert_eq!(t.state.clients.get(0).unwrap().role, Role::None);
        assert_eq!(t.state.mastermode, MasterMode::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_bans_address() {
        let mut t = admin_and_player();
        t.receive(1, &packet(|p| {
            p.put_int(Msg::Kick.code()).put_int(0).put_string("");
        }));
        assert!(t.disconnects().is_empty());

        t.receive(0, &packet(|p| {
            p.put_int(Msg::Kick.code()).put_int(1).put_string("camping");
        }));
        assert_eq!(t.disconnects(), vec![(PeerId(1), DisconnectReason::Kick)]);
        let ban = t.state.bans.lookup("10.0.0.2".parse().unwrap()).unwrap();
        assert!(ban.expires_at.is_some());

        t.join(1, "bob");
        assert_eq!(t.disconnects()[1], (PeerId(1), DisconnectReason::IpBanned));

        t.receive(0, &packet(|p| {
            p.put_int(Msg::ClearBans.code());
        }));
        assert!(t.state.bans.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_votes() {
        let mut t = admin_and_player();
        let vote = |map: &str, mode: ModeId| {
            packet(|p| {
                p.put_int(Msg::MapVote.code()).put_string(map).put_int(mode.0);
            })
        };

        t.receive(1, &vote("douze", ModeId::INSTA));
        t.receive(1, &vote("nowhere", ModeId::INSTA));
        t.receive(1, &vote("hallo", ModeId::CTF));
        assert_eq!(t.state.rotation.queued().collect::<Vec<_>>(), vec!["douze"]);

        t.receive(0, &vote("hallo", ModeId::INSTA_CTF));
        assert_eq!(t.state.mode.id(), ModeId::INSTA_CTF);
        assert_eq!(t.state.map, "hallo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_spectator_toggle() {
        let mut t = admin_and_player();
        let spectate = |cn: i32, on: bool| {
            packet(|p| {
                p.put_int(Msg::Spectator.code()).put_int(cn).put_bool(on);
            })
        };

        t.receive(1, &spectate(0, true));
        assert!(!t.state.clients.get(0).unwrap().state.is_spectator());

        t.receive(0, &spectate(1, true));
        let bob = &t.state.clients.get(1).unwrap().state;
        assert!(bob.is_spectator());
        assert_eq!(bob.deaths, 1);
        assert!(t.sent_to(1).contains(&vec![62, 1, 1]));

        t.state.mastermode = MasterMode::Locked;
        t.receive(1, &spectate(1, false));
        assert!(t.state.clients.get(1).unwrap().state.is_spectator());
        t.state.mastermode = MasterMode::Open;
        t.receive(1, &spectate(1, false));
        assert_eq!(t.state.clients.get(1).unwrap().state.life, LifeState::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_team() {
        let mut t = TestServer::new(ServerConfig {
            fallback_mode: ModeId::INSTA_TEAM,
            ..ServerConfig::default()
        });
        t.join(0, "alice");
        let before = t.state.clients.get(0).unwrap().team.clone();
        let other = if before == "good" { "evil" } else { "good" };

        t.receive(0, &packet(|p| {
            p.put_int(Msg::SwitchTeam.code()).put_string("pirates");
        }));
        assert_eq!(t.state.clients.get(0).unwrap().team, before);

        t.receive(0, &packet(|p| {
            p.put_int(Msg::SwitchTeam.code()).put_string(other);
        }));
        assert_eq!(t.state.clients.get(0).unwrap().team, other);
        let mut expected = vec![64, 0];
        expected.extend_from_slice(other.as_bytes());
        expected.extend_from_slice(&[0, 0]);
        assert!(t.sent_to(0).contains(&expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_needs_privilege() {
        let mut t = admin_and_player();
        let pause = |on: bool| {
            packet(|p| {
                p.put_int(Msg::PauseGame.code()).put_bool(on);
            })
        };
        t.receive(1, &pause(true));
        assert!(!t.state.mode.is_paused());
        t.receive(0, &pause(true));
        assert!(t.state.mode.is_paused());
        assert!(t.sent_to(1).contains(&vec![94, 1, 0]));
        t.receive(0, &pause(false));
        assert!(!t.state.mode.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename() {
        let mut t = TestServer::insta();
        t.join(0, "alice");
        t.receive(0, &packet(|p| {
            p.put_int(Msg::SwitchName.code()).put_string("  \u{c}3carol  ");
        }));
        assert_eq!(t.state.clients.get(0).unwrap().name, "carol");
    }
}
