//! Game Server
//!
//! One task owns every piece of game state and reacts to whatever wakes it
//! first:
//!
//! ```text
//!   transport events ─┐
//!   callbacks ────────┤
//!   master/stats ─────┤
//!   info queries ─────┼──▶ select! ──▶ ServerState
//!   clock tick ───────┤
//!   timers ───────────┤
//!   auth sweep (10s) ─┤
//!   re-register (1h) ─┘
//! ```
//!
//! Work finished elsewhere (auth replies) comes back as a callback closure
//! and only runs if the client it was started for still holds the same
//! session.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::auth::local::{load_users, User};
use crate::auth::{AuthError, AuthManager, LocalProvider, RemoteProvider};
use crate::config::ServerConfig;
use crate::core::packet::Packet;
use crate::core::timer::TimerQueue;
use crate::core::vec3::{Vec3, DMF, DNF};
use crate::game::combat::{Explosion, Shot};
use crate::game::mode::{GameMode, GameTimer, ModeCtx, ModeEvent, ModeId, ModeSettings};
use crate::game::rotation::MapRotation;
use crate::game::state::LifeState;
use crate::game::weapon::Weapon;
use crate::network::bans::{Ban, BanError, BanManager, Ipv4Net};
use crate::network::client::sanitize_name;
use crate::network::clients::ClientManager;
use crate::network::extinfo::{InfoRequest, InfoSocket, InfoView};
use crate::network::master::{self, MasterEvent, MasterHandle, MasterLink, MasterReply};
use crate::network::protocol::{
    color, DisconnectReason, MasterMode, Msg, Role, MESSAGE_CHANNEL, PROTOCOL_VERSION,
};
use crate::network::relay::Relay;
use crate::network::transport::{Host, HostEvent, PeerId, TransportError, UdpHost};

/// Pause between the end of a match and the next map.
pub const INTERMISSION_DELAY: Duration = Duration::from_secs(10);

/// How often stale auth requests are swept.
pub const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// How often the server registers with the master again.
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Length of the ban that comes with a kick.
pub const KICK_BAN_HOURS: i64 = 4;

/// Scope of bans pushed by the master server.
pub const GLOBAL_BAN_DOMAIN: &str = "master";

/// Work handed back to the server loop.
pub type Callback = Box<dyn FnOnce(&mut ServerState) + Send>;

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind a socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] TransportError),

    /// The configured mode cannot be run.
    #[error("Unsupported game mode: {0:?}")]
    UnsupportedMode(ModeId),

    /// The map pool of the configured mode is empty.
    #[error("No maps for mode {0:?}")]
    NoMaps(ModeId),

    /// Users file could not be loaded.
    #[error("Auth setup failed: {0}")]
    Auth(#[from] AuthError),

    /// Bans file could not be loaded.
    #[error("Ban list failed: {0}")]
    Bans(#[from] BanError),
}

/// Borrow the pieces of `ServerState` a mode may touch.
macro_rules! mode_ctx {
    ($s:expr) => {
        ModeCtx {
            clients: &mut $s.clients,
            timers: &mut $s.timers,
            events: &mut $s.events,
        }
    };
}
pub(crate) use mode_ctx;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Everything the server loop owns.
pub struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) clients: ClientManager,
    pub(crate) mode: GameMode,
    pub(crate) map: String,
    pub(crate) next_map: Option<String>,
    pub(crate) mastermode: MasterMode,
    pub(crate) settings: ModeSettings,
    pub(crate) report_stats: bool,
    pub(crate) rotation: MapRotation,
    pub(crate) auth: AuthManager,
    pub(crate) bans: Arc<BanManager>,
    pub(crate) timers: TimerQueue<GameTimer>,
    pub(crate) events: Vec<ModeEvent>,
    pub(crate) master: Option<MasterHandle>,
    pub(crate) stats: Option<MasterHandle>,
    pub(crate) stats_supported: bool,
    callbacks: mpsc::UnboundedSender<Callback>,
    started: Instant,
}

impl ServerState {
    /// Create the state and start the fallback mode on its first map.
    /// Callbacks arrive on the returned channel.
    pub fn new(
        config: ServerConfig,
        host: Arc<dyn Host>,
        relay: Relay,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Callback>), GameServerError> {
        let settings = config.mode_settings();
        let fallback = config.fallback_mode;
        let mode = GameMode::new(fallback, &settings).ok_or(GameServerError::UnsupportedMode(fallback))?;
        let mut rotation = MapRotation::new(config.maps.clone());
        let map = rotation
            .next_map(fallback, fallback, "")
            .ok_or(GameServerError::NoMaps(fallback))?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = Self {
            clients: ClientManager::new(host, relay, config.max_clients),
            mode,
            map,
            next_map: None,
            mastermode: MasterMode::Open,
            report_stats: config.report_stats,
            settings,
            rotation,
            auth: AuthManager::new(),
            bans: Arc::new(BanManager::new()),
            timers: TimerQueue::new(),
            events: Vec::new(),
            master: None,
            stats: None,
            stats_supported: false,
            callbacks: tx,
            started: Instant::now(),
            config,
        };
        state.mode.start(&mut mode_ctx!(state));
        info!("Starting {} on {}", state.mode.id(), state.map);
        Ok((state, rx))
    }

    /// Load the users and bans files named in the config.
    pub fn load_files(&mut self) -> Result<(), GameServerError> {
        if let Some(path) = self.config.users_file.clone() {
            let users = load_users(&path)?;
            self.add_users(users)?;
        }
        if let Some(path) = self.config.bans_file.clone() {
            let count = self.bans.load(&path)?;
            info!("Loaded {} bans from {}", count, path.display());
        }
        Ok(())
    }

    /// Serve `users` from local providers, one per domain. Users without a
    /// domain belong to the primary domain.
    pub fn add_users(&mut self, users: Vec<User>) -> Result<(), AuthError> {
        let mut providers: BTreeMap<String, LocalProvider> = BTreeMap::new();
        for user in users {
            let domain = if user.domain.is_empty() {
                self.config.auth_domain.clone()
            } else {
                user.domain.clone()
            };
            providers
                .entry(domain)
                .or_default()
                .add_user(&user.name, &user.public_key, user.role)?;
        }
        for (domain, provider) in providers {
            info!("Auth domain '{}' with {} users", domain, provider.user_count());
            self.auth.add_provider(&domain, Box::new(provider));
        }
        Ok(())
    }

    /// Start the master and stats links. Their auth domains go to remote
    /// providers unless a local provider already serves them.
    pub fn connect_links(&mut self, events: mpsc::UnboundedSender<(MasterLink, MasterEvent)>) {
        let port = self.config.listen_port;
        if let Some(addr) = self.config.master_server.clone() {
            let handle = master::spawn(MasterLink::Master, addr, port, events.clone());
            self.add_remote_provider(MasterLink::Master, &handle);
            self.master = Some(handle);
        }
        if let Some(addr) = self.config.stats_server.clone() {
            let handle = master::spawn(MasterLink::Stats, addr, port, events);
            self.add_remote_provider(MasterLink::Stats, &handle);
            self.stats = Some(handle);
        }
    }

    fn add_remote_provider(&mut self, link: MasterLink, handle: &MasterHandle) {
        let domain = self.link_domain(link);
        if self.auth.has_domain(&domain) {
            return;
        }
        let mut remote = RemoteProvider::new();
        remote.connect(handle.sender());
        self.auth.add_provider(&domain, Box::new(remote));
    }

    fn link_domain(&self, link: MasterLink) -> String {
        match link {
            MasterLink::Master => String::new(),
            MasterLink::Stats => self.config.stats_auth_domain.clone(),
        }
    }

    /// Run a callback from the callback channel.
    pub fn run_callback(&mut self, callback: Callback) {
        callback(self);
    }

    /// True while slot `cn` is held by session `session`.
    pub fn is_session(&self, cn: u32, session: u32) -> bool {
        self.clients.get(cn).map_or(false, |c| c.session_id == session)
    }

    /// Wrap `f` so that it runs on the server loop, and only while `cn`
    /// keeps its current session.
    pub fn reenter<T: Send + 'static>(
        &self,
        cn: u32,
        f: impl FnOnce(&mut ServerState, T) + Send + 'static,
    ) -> Box<dyn FnOnce(T) + Send> {
        let session = self.clients.get(cn).map_or(0, |c| c.session_id);
        let tx = self.callbacks.clone();
        Box::new(move |value| {
            let callback: Callback = Box::new(move |s: &mut ServerState| {
                if s.is_session(cn, session) {
                    f(s, value);
                } else {
                    debug!(cn, session, "dropping callback for a stale session");
                }
            });
            let _ = tx.send(callback);
        })
    }

    /// State for server info replies.
    pub fn info_view(&self) -> InfoView<'_> {
        InfoView {
            clients: &self.clients,
            mode: &self.mode,
            map: &self.map,
            description: &self.config.description,
            mastermode: self.mastermode,
            uptime: self.started.elapsed(),
        }
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// React to a transport event.
    pub fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connect { peer, addr } => self.on_connect(peer, addr),
            HostEvent::Disconnect { peer } => {
                if let Some(cn) = self.clients.by_peer(peer) {
                    self.disconnect(cn, DisconnectReason::None);
                }
            }
            HostEvent::Receive { peer, channel, data } => {
                let Some(cn) = self.clients.by_peer(peer) else {
                    debug!(?peer, "datagram from unknown peer");
                    return;
                };
                if channel > MESSAGE_CHANNEL {
                    debug!(cn, channel, "datagram on unknown channel");
                    return;
                }
                let mut p = Packet::from_bytes(data);
                self.handle_packet(cn, channel, &mut p);
            }
        }
    }

    fn on_connect(&mut self, peer: PeerId, addr: SocketAddr) {
        let cn = self.clients.add(peer, addr);
        let session_id = self.clients.get(cn).map_or(0, |c| c.session_id);
        let mut p = Packet::new();
        p.put_int(Msg::ServerInfo.code())
            .put_int(cn as i32)
            .put_int(PROTOCOL_VERSION)
            .put_int(session_id as i32)
            .put_bool(false)
            .put_string(&self.config.description)
            .put_string(&self.config.auth_domain);
        self.clients.send(cn, MESSAGE_CHANNEL, true, &p);
        info!("Client {} connected from {}", cn, addr);
    }

    /// Remove a client and apply the policies for what is left behind.
    pub fn disconnect(&mut self, cn: u32, reason: DisconnectReason) {
        let Some(joined) = self.clients.get(cn).map(|c| c.joined) else { return };
        if joined {
            self.mode.leave(&mut mode_ctx!(self), cn);
        }
        self.auth.clear_client(cn);
        let Some(departure) = self.clients.disconnect(cn, reason) else { return };
        self.process_mode_events();
        if departure.empty {
            self.on_empty();
        } else if departure.unsupervised {
            self.on_unsupervised();
        }
    }

    /// Nobody holds a role any more: back to open and the configured
    /// policy, and never leave the game paused. Competitive games resume
    /// through the countdown.
    fn on_unsupervised(&mut self) {
        let settings = self.config.mode_settings();
        let changed = self.mastermode != MasterMode::Open || self.settings != settings;
        self.mastermode = MasterMode::Open;
        self.settings = settings;
        self.report_stats = self.config.report_stats;
        if changed {
            let p = self.clients.masters_packet(self.mastermode);
            self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
            debug!("server unsupervised, policy reset");
        }
        self.mode.resume(&mut mode_ctx!(self), None);
    }

    /// The last client left: forget the queue and go back to the fallback
    /// mode.
    fn on_empty(&mut self) {
        self.rotation.clear_queue();
        self.mastermode = MasterMode::Open;
        self.settings = self.config.mode_settings();
        self.report_stats = self.config.report_stats;
        let mode = self.config.fallback_mode;
        let map = self
            .rotation
            .next_map(mode, self.mode.id(), &self.map)
            .unwrap_or_else(|| self.map.clone());
        info!("Server empty, restarting {} on {}", mode, map);
        self.start_game(mode, &map);
    }

    // -------------------------------------------------------------------------
    // Join and auth
    // -------------------------------------------------------------------------

    /// Why `cn` may not join right now.
    fn join_rejection(&self, cn: u32) -> Option<DisconnectReason> {
        let client = self.clients.get(cn)?;
        if let Some(ban) = client.ipv4().and_then(|ip| self.bans.lookup(ip)) {
            debug!(cn, reason = %ban.reason, "banned client");
            return Some(DisconnectReason::IpBanned);
        }
        if self.mastermode >= MasterMode::Private {
            return Some(DisconnectReason::PrivateMode);
        }
        if self.clients.is_full() {
            return Some(DisconnectReason::Full);
        }
        None
    }

    /// Handle a join request. A rejected client may still get in by
    /// authenticating in the primary domain.
    pub fn request_join(&mut self, cn: u32, name: &str, model: i32, auth_domain: &str, auth_name: &str) {
        let Some(client) = self.clients.get_mut(cn) else { return };
        client.name = sanitize_name(name);
        client.model = model;
        let wants_auth = !auth_name.is_empty() && self.auth.has_domain(auth_domain);

        match self.join_rejection(cn) {
            Some(reason) if wants_auth && auth_domain == self.config.auth_domain => {
                if let Some(client) = self.clients.get_mut(cn) {
                    client.auth_required_because = Some(reason);
                }
                debug!(cn, ?reason, "join needs authentication");
                self.start_auth(cn, auth_domain, auth_name);
            }
            Some(reason) => self.disconnect(cn, reason),
            None => {
                self.join(cn);
                if wants_auth {
                    self.start_auth(cn, auth_domain, auth_name);
                }
            }
        }
    }

    /// Let `cn` into the game.
    pub fn join(&mut self, cn: u32) {
        let locked = self.mastermode >= MasterMode::Locked;
        let Some(client) = self.clients.get_mut(cn) else { return };
        client.joined = true;
        client.auth_required_because = None;
        client.state.reset_for_map();
        client.state.life = if locked { LifeState::Spectator } else { LifeState::Dead };
        self.clients.enter_relay(cn);
        self.mode.join(&mut mode_ctx!(self), cn);
        if !locked && self.mode.clock().is_running() {
            if let Some(client) = self.clients.get_mut(cn) {
                self.mode.spawn(client);
            }
        }

        let welcome = self.clients.welcome_packet(cn, &self.map, &self.mode, self.mastermode);
        self.clients.send(cn, MESSAGE_CHANNEL, true, &welcome);
        let Some(client) = self.clients.get(cn) else { return };
        let mut init = Packet::new();
        client.write_init(&mut init);
        self.clients.broadcast(Some(cn), MESSAGE_CHANNEL, true, &init);
        info!("{} ({}) joined", client.name, cn);

        if !self.config.motd.is_empty() {
            self.clients.send_server_message(cn, &self.config.motd);
        }
    }

    /// Challenge `cn` as `name` in `domain`.
    pub fn start_auth(&mut self, cn: u32, domain: &str, name: &str) {
        if !self.auth.has_domain(domain) {
            self.clients
                .send_server_message(cn, &format!("{}unknown auth domain '{}'", color::RED, domain));
            return;
        }
        let owned = domain.to_string();
        let callback = self.reenter(cn, move |s, result: Result<(u32, String), AuthError>| {
            s.on_challenge(cn, &owned, result)
        });
        self.auth.request_challenge(cn, domain, name, callback);
    }

    fn on_challenge(&mut self, cn: u32, domain: &str, result: Result<(u32, String), AuthError>) {
        match result {
            Ok((req_id, challenge)) => {
                let mut p = Packet::new();
                p.put_int(Msg::AuthChallenge.code())
                    .put_string(domain)
                    .put_int(req_id as i32)
                    .put_string(&challenge);
                self.clients.send(cn, MESSAGE_CHANNEL, true, &p);
            }
            Err(e) => self.auth_failed(cn, &e),
        }
    }

    /// Check `cn`'s answer to request `req_id`.
    pub fn confirm_auth(&mut self, cn: u32, domain: &str, req_id: u32, answer: &str) {
        let owned = domain.to_string();
        let callback = self.reenter(cn, move |s, result: Result<(String, Role), AuthError>| {
            s.on_answer(cn, &owned, result)
        });
        self.auth.request_confirmation(req_id, cn, domain, answer, callback);
    }

    fn on_answer(&mut self, cn: u32, domain: &str, result: Result<(String, Role), AuthError>) {
        let (name, role) = match result {
            Ok(ok) => ok,
            Err(e) => return self.auth_failed(cn, &e),
        };
        let Some(client) = self.clients.get_mut(cn) else { return };
        client.auth_names.insert(domain.to_string(), name.clone());
        let pending_join = !client.joined && client.auth_required_because.is_some();
        info!("Client {} authenticated as '{}' in domain '{}'", cn, name, domain);

        if pending_join {
            self.join(cn);
        }
        if domain == self.config.auth_domain && role.is_privileged() {
            self.grant_role(cn, role, &name);
        } else {
            self.clients
                .send_server_message(cn, &format!("{}you authenticated as '{}'", color::GREEN, name));
        }
    }

    fn auth_failed(&mut self, cn: u32, err: &AuthError) {
        debug!(cn, "authentication failed: {}", err);
        match self.clients.get(cn).and_then(|c| c.auth_required_because) {
            Some(reason) => self.disconnect(cn, reason),
            None => self
                .clients
                .send_server_message(cn, &format!("{}authentication failed: {}", color::RED, err)),
        }
    }

    fn grant_role(&mut self, cn: u32, role: Role, auth_name: &str) {
        let Some(client) = self.clients.get_mut(cn) else { return };
        if role <= client.role {
            return;
        }
        client.role = role;
        let name = self.clients.unique_name(cn);
        self.clients.broadcast_server_message(&format!(
            "{} claimed {} as {}{}'{}'{}",
            name,
            role,
            color::SAVE,
            color::MAGENTA,
            auth_name,
            color::RESTORE
        ));
        let p = self.clients.masters_packet(self.mastermode);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
    }

    /// Set `cn`'s role and announce it.
    pub fn set_role(&mut self, cn: u32, role: Role) {
        let Some(client) = self.clients.get_mut(cn) else { return };
        let old = client.role;
        if old == role {
            return;
        }
        client.role = role;
        let name = self.clients.unique_name(cn);
        let text = if role.is_privileged() {
            format!("{} claimed {}", name, role)
        } else {
            format!("{} relinquished {}", name, old)
        };
        self.clients.broadcast_server_message(&text);
        let p = self.clients.masters_packet(self.mastermode);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        if !self.clients.has_privileged() {
            self.on_unsupervised();
        }
    }

    // -------------------------------------------------------------------------
    // Combat
    // -------------------------------------------------------------------------

    fn life_of(&self, cn: u32) -> Option<i32> {
        self.clients
            .get(cn)
            .filter(|c| c.state.is_alive())
            .map(|c| c.state.life_sequence)
    }

    /// Grant `cn` a new life and tell them about it.
    pub fn spawn(&mut self, cn: u32) {
        let Some(client) = self.clients.get_mut(cn) else { return };
        self.mode.spawn(client);
        let mut p = Packet::new();
        p.put_int(Msg::SpawnState.code()).put_int(cn as i32);
        client.state.write_spawn_state(&mut p);
        self.clients.send(cn, MESSAGE_CHANNEL, true, &p);
    }

    /// Book a shot and apply its hitscan damage.
    pub fn shoot(&mut self, cn: u32, shot: Shot) {
        let now = self.mode.millis();
        let Some(client) = self.clients.get_mut(cn) else { return };
        if !client.state.try_shoot(shot.weapon, now) {
            debug!(cn, weapon = ?shot.weapon, "shot rejected");
            return;
        }
        if shot.weapon.is_projectile() {
            client.state.projectiles.insert((shot.weapon, shot.id));
        }
        let multiplier = client.state.damage_multiplier();

        let mut p = Packet::new();
        p.put_int(Msg::ShotEffects.code())
            .put_int(cn as i32)
            .put_int(shot.weapon.id())
            .put_int(shot.id);
        for v in shot.from.to_wire(DMF).into_iter().chain(shot.to.to_wire(DMF)) {
            p.put_int(v);
        }
        self.clients.broadcast(Some(cn), MESSAGE_CHANNEL, true, &p);

        if shot.weapon.is_projectile() {
            return;
        }
        let damages = shot.damages(multiplier, |t| self.life_of(t));
        for d in damages {
            self.apply_damage(cn, d.target, shot.weapon, d.amount, d.direction);
        }
    }

    /// Detonate a projectile and apply its splash damage.
    pub fn explode(&mut self, cn: u32, explosion: Explosion) {
        let Some(client) = self.clients.get_mut(cn) else { return };
        if !client.state.projectiles.remove(&(explosion.weapon, explosion.id)) {
            debug!(cn, id = explosion.id, "explosion of unknown projectile");
            return;
        }
        let multiplier = client.state.damage_multiplier();

        let mut p = Packet::new();
        p.put_int(Msg::ExplodeEffects.code())
            .put_int(cn as i32)
            .put_int(explosion.weapon.id())
            .put_int(explosion.id);
        self.clients.broadcast(Some(cn), MESSAGE_CHANNEL, true, &p);

        let damages = explosion.damages(cn, multiplier, |t| self.life_of(t));
        for d in damages {
            self.apply_damage(cn, d.target, explosion.weapon, d.amount, d.direction);
        }
    }

    /// Damage `target`, push it, and kill it if its health is gone.
    pub fn apply_damage(&mut self, actor: u32, target: u32, weapon: Weapon, amount: i32, direction: Vec3) {
        let Some(victim) = self.clients.get_mut(target).filter(|c| c.state.is_alive()) else {
            return;
        };
        victim.state.apply_damage(amount);
        let armour = victim.state.armour;
        let health = victim.state.health;
        let reported = victim.state.reported_health();
        if actor != target {
            if let Some(a) = self.clients.get_mut(actor) {
                a.state.damage += amount;
            }
        }

        let mut p = Packet::new();
        p.put_int(Msg::Damage.code())
            .put_int(target as i32)
            .put_int(actor as i32)
            .put_int(amount)
            .put_int(armour)
            .put_int(reported);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);

        let died = health <= 0;
        if !direction.is_zero() {
            let mut push = Packet::new();
            push.put_int(Msg::HitPush.code())
                .put_int(target as i32)
                .put_int(weapon.id())
                .put_int(amount);
            for v in direction.to_wire(DNF) {
                push.put_int(v);
            }
            if died {
                self.clients.broadcast(None, MESSAGE_CHANNEL, true, &push);
            } else {
                self.clients.send(target, MESSAGE_CHANNEL, true, &push);
            }
        }
        if died {
            self.kill(actor, target);
        }
    }

    /// `actor` fragged `victim` (possibly themselves).
    pub fn kill(&mut self, actor: u32, victim: u32) {
        let (frags, team_frags) = self.mode.frag(&mut mode_ctx!(self), actor, victim);
        let mut p = Packet::new();
        p.put_int(Msg::Died.code())
            .put_int(victim as i32)
            .put_int(actor as i32)
            .put_int(frags)
            .put_int(team_frags);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        self.mode.died(&mut mode_ctx!(self), victim);
        self.process_mode_events();
    }

    // -------------------------------------------------------------------------
    // Matches
    // -------------------------------------------------------------------------

    pub(crate) fn process_mode_events(&mut self) {
        for event in std::mem::take(&mut self.events) {
            match event {
                ModeEvent::Intermission => self.intermission(),
            }
        }
    }

    /// One clock tick.
    pub fn on_tick(&mut self) {
        if self.mode.advance_clock() {
            self.intermission();
        }
    }

    /// A timer fired.
    pub fn on_timer(&mut self, timer: GameTimer) {
        match timer {
            GameTimer::NextMap => {
                let map = self.next_map.take().unwrap_or_else(|| self.map.clone());
                let id = self.mode.id();
                self.start_game(id, &map);
            }
            other => {
                self.mode.on_timer(&mut mode_ctx!(self), other);
                self.process_mode_events();
            }
        }
    }

    /// End the match: stop the clock, announce the next map and report
    /// stats. The next map starts after the intermission delay.
    pub fn intermission(&mut self) {
        if self.timers.contains(&GameTimer::NextMap) {
            return;
        }
        self.mode.end(&mut mode_ctx!(self));
        let id = self.mode.id();
        let next = self
            .rotation
            .next_map(id, id, &self.map)
            .unwrap_or_else(|| self.map.clone());

        let mut p = Packet::new();
        p.put_int(Msg::TimeLeft.code()).put_int(0);
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        self.clients
            .broadcast_server_message(&format!("next map: {}{}", color::ORANGE, next));
        info!("Intermission on {}, next map {}", self.map, next);

        self.next_map = Some(next);
        self.timers.schedule(GameTimer::NextMap, INTERMISSION_DELAY);
        if let (Some(stats), Some(line)) = (&self.stats, self.stats_line()) {
            stats.send(line);
        }
    }

    /// Result line for the stats server, if reporting applies: one entry per
    /// client authenticated in the stats domain.
    pub fn stats_line(&self) -> Option<String> {
        if !self.report_stats || !self.stats_supported {
            return None;
        }
        let domain = &self.config.stats_auth_domain;
        let entries: Vec<String> = self
            .clients
            .joined()
            .filter_map(|c| {
                let name = c.auth_name(domain)?;
                Some(format!(
                    "{} {} {} {} {} {} {}",
                    c.cn,
                    name,
                    c.state.frags,
                    c.state.deaths,
                    c.state.damage,
                    c.state.damage_potential,
                    c.state.flags
                ))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(format!("stats {} {} {}", self.mode.id().0, self.map, entries.join(" ")))
    }

    /// Start `id` on `map` for everyone. False for unsupported modes.
    pub fn start_game(&mut self, id: ModeId, map: &str) -> bool {
        let Some(mode) = GameMode::new(id, &self.settings) else {
            warn!("Cannot start unsupported mode {:?}", id);
            return false;
        };
        self.mode.end(&mut mode_ctx!(self));
        self.timers.cancel_where(|_| true);
        self.events.clear();
        self.mode = mode;
        self.map = map.to_string();
        self.next_map = None;

        for c in self.clients.iter_mut() {
            c.state.reset_for_map();
            if !c.state.is_spectator() {
                c.state.life = LifeState::Dead;
            }
            if !id.is_teamed() {
                c.team.clear();
            }
        }
        let players: Vec<u32> = self.clients.joined().map(|c| c.cn).collect();
        for &cn in &players {
            self.mode.join(&mut mode_ctx!(self), cn);
        }

        let mut p = Packet::new();
        p.put_int(Msg::MapChange.code())
            .put_string(map)
            .put_int(id.0)
            .put_bool(self.mode.needs_map_info());
        p.put_int(Msg::TimeLeft.code())
            .put_int(self.mode.time_left().as_secs() as i32);
        if id.is_teamed() {
            for c in self.clients.joined().filter(|c| !c.team.is_empty()) {
                p.put_int(Msg::SetTeam.code())
                    .put_int(c.cn as i32)
                    .put_string(&c.team)
                    .put_int(-1);
            }
        }
        self.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);

        self.mode.start(&mut mode_ctx!(self));
        for &cn in &players {
            if self.clients.get(cn).map_or(false, |c| !c.state.is_spectator()) {
                self.spawn(cn);
            }
        }
        info!("Starting {} on {}", id, map);
        true
    }

    // -------------------------------------------------------------------------
    // Master and stats links
    // -------------------------------------------------------------------------

    /// React to a master or stats link event.
    pub fn handle_master_event(&mut self, link: MasterLink, event: MasterEvent) {
        let domain = self.link_domain(link);
        match event {
            MasterEvent::Connected => info!("{:?} link established", link),
            MasterEvent::Disconnected => {
                self.auth.connection_lost(&domain);
                if link == MasterLink::Stats {
                    self.stats_supported = false;
                }
            }
            MasterEvent::Line(line) => {
                if self.auth.handle_line(&domain, &line) {
                    return;
                }
                match MasterReply::parse(&line) {
                    Some(MasterReply::Registered) => info!("Registered with the {:?} server", link),
                    Some(MasterReply::RegistrationFailed(reason)) => {
                        warn!("{:?} server refused registration: {}", link, reason)
                    }
                    Some(MasterReply::AddGlobalBan(network)) => self.add_global_ban(network),
                    Some(MasterReply::ClearGlobalBans) => {
                        self.bans.clear_domain(GLOBAL_BAN_DOMAIN);
                        info!("Global bans cleared");
                    }
                    Some(MasterReply::Supports(extensions)) => {
                        if link == MasterLink::Stats {
                            self.stats_supported = extensions.iter().any(|e| e == "succstats");
                        }
                    }
                    Some(MasterReply::StatsAccepted) => {
                        info!("Stats accepted");
                        self.clients
                            .broadcast_server_message(&format!("{}stats reported", color::GREEN));
                    }
                    Some(MasterReply::StatsRejected(reason)) => {
                        warn!("Stats rejected: {}", reason);
                        self.clients.broadcast_server_message(&format!(
                            "{}stats not reported: {}",
                            color::RED,
                            reason
                        ));
                    }
                    None => debug!(?link, line = %line, "unhandled master line"),
                }
            }
        }
    }

    fn add_global_ban(&mut self, network: Ipv4Net) {
        self.bans.add(Ban {
            network,
            reason: "global ban".to_string(),
            expires_at: None,
            domain: GLOBAL_BAN_DOMAIN.to_string(),
        });
        let victims: Vec<u32> = self
            .clients
            .iter()
            .filter(|c| !c.role.is_privileged() && c.ipv4().map_or(false, |ip| network.contains(ip)))
            .map(|c| c.cn)
            .collect();
        for cn in victims {
            self.disconnect(cn, DisconnectReason::IpBanned);
        }
    }

    /// Ban `cn`'s address for the kick ban duration.
    pub(crate) fn ban_client(&self, cn: u32, reason: &str) {
        let Some(ip) = self.clients.get(cn).and_then(|c| c.ipv4()) else { return };
        if let Ok(network) = Ipv4Net::new(ip, 32) {
            let expires = Utc::now() + chrono::Duration::hours(KICK_BAN_HOURS);
            self.bans.ban(network, reason, Some(expires));
        }
    }

    /// Expire stale auth requests.
    pub fn sweep_auth(&mut self) {
        self.auth.sweep(Instant::now());
    }

    /// Register with the master server again.
    pub fn reregister(&self) {
        if let Some(master) = &self.master {
            master.register();
        }
    }
}

// =============================================================================
// GAME SERVER
// =============================================================================

enum Wake {
    Host(HostEvent),
    Callback(Callback),
    Master(MasterLink, MasterEvent),
    Info(InfoRequest),
    Tick,
    Timers,
    AuthSweep,
    Register,
    Shutdown,
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { config, shutdown_tx }
    }

    /// Bind the sockets and run until shut down.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let (host, mut host_events) = UdpHost::bind(self.config.game_addr()).await?;
        let (info_socket, mut info_requests) = InfoSocket::bind(self.config.info_addr()).await?;
        let relay = Relay::new();
        let flusher = relay.spawn_flusher();

        let (mut state, mut callbacks) = ServerState::new(self.config.clone(), host, relay)?;
        state.load_files()?;
        let (master_tx, mut master_events) = mpsc::unbounded_channel();
        state.connect_links(master_tx);

        let mut auth_sweep = interval(AUTH_SWEEP_INTERVAL);
        let mut reregister = interval_at(Instant::now() + REGISTER_INTERVAL, REGISTER_INTERVAL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("Game server running on {}", self.config.game_addr());

        loop {
            let wake = tokio::select! {
                Some(event) = host_events.recv() => Wake::Host(event),
                Some(callback) = callbacks.recv() => Wake::Callback(callback),
                Some((link, event)) = master_events.recv() => Wake::Master(link, event),
                Some(request) = info_requests.recv() => Wake::Info(request),
                _ = state.mode.next_tick() => Wake::Tick,
                _ = state.timers.next_expiry() => Wake::Timers,
                _ = auth_sweep.tick() => Wake::AuthSweep,
                _ = reregister.tick() => Wake::Register,
                _ = shutdown_rx.recv() => Wake::Shutdown,
            };
            match wake {
                Wake::Host(event) => state.handle_host_event(event),
                Wake::Callback(callback) => state.run_callback(callback),
                Wake::Master(link, event) => state.handle_master_event(link, event),
                Wake::Info(request) => info_socket.reply(&request, &state.info_view()),
                Wake::Tick => state.on_tick(),
                Wake::Timers => {
                    for timer in state.timers.pop_expired(Instant::now()) {
                        state.on_timer(timer);
                    }
                }
                Wake::AuthSweep => state.sweep_auth(),
                Wake::Register => state.reregister(),
                Wake::Shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        flusher.abort();
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

// =============================================================================
// TEST HARNESS
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::network::transport::testing::RecordingHost;

    /// A server state wired to a recording host.
    pub(crate) struct TestServer {
        pub state: ServerState,
        pub callbacks: mpsc::UnboundedReceiver<Callback>,
        pub host: Arc<RecordingHost>,
    }

    impl TestServer {
        pub fn new(config: ServerConfig) -> Self {
            let host = Arc::new(RecordingHost::default());
            let (state, callbacks) = ServerState::new(config, host.clone(), Relay::new()).unwrap();
            Self { state, callbacks, host }
        }

        /// Instagib, so that a single rifle hit kills.
        pub fn insta() -> Self {
            Self::new(ServerConfig {
                fallback_mode: ModeId::INSTA,
                ..ServerConfig::default()
            })
        }

        /// Connect peer `n` from 10.0.0.(n+1).
        pub fn connect(&mut self, n: u64) -> u32 {
            let addr: SocketAddr = format!("10.0.0.{}:40000", n + 1).parse().unwrap();
            self.state
                .handle_host_event(HostEvent::Connect { peer: PeerId(n), addr });
            self.state.clients.by_peer(PeerId(n)).unwrap()
        }

        /// Deliver a datagram from peer `n` and run the callbacks it caused.
        pub fn receive(&mut self, n: u64, p: &Packet) {
            self.state.handle_host_event(HostEvent::Receive {
                peer: PeerId(n),
                channel: MESSAGE_CHANNEL,
                data: p.as_bytes().to_vec(),
            });
            self.drain();
        }

        pub fn drain(&mut self) {
            while let Ok(callback) = self.callbacks.try_recv() {
                self.state.run_callback(callback);
            }
        }

        /// Connect and join peer `n`.
        pub fn join(&mut self, n: u64, name: &str) -> u32 {
            let cn = self.connect(n);
            self.receive(n, &join_packet(name, "", ""));
            cn
        }

        /// Join and confirm the granted spawn.
        pub fn join_alive(&mut self, n: u64, name: &str) -> u32 {
            let cn = self.join(n, name);
            let state = &self.state.clients.get(cn).unwrap().state;
            let mut p = Packet::new();
            p.put_int(Msg::Spawn.code())
                .put_int(state.life_sequence)
                .put_int(state.selected_weapon.id());
            self.receive(n, &p);
            assert!(self.state.clients.get(cn).unwrap().state.is_alive());
            cn
        }

        pub fn sent_to(&self, n: u64) -> Vec<Vec<u8>> {
            self.host.sent_to(PeerId(n))
        }

        /// Leading message code of every datagram sent to peer `n`.
        pub fn codes_sent_to(&self, n: u64) -> Vec<i32> {
            self.sent_to(n)
                .into_iter()
                .filter_map(|d| Packet::from_bytes(d).get_int())
                .collect()
        }

        pub fn disconnects(&self) -> Vec<(PeerId, DisconnectReason)> {
            self.host.disconnects()
        }
    }

    pub(crate) fn join_packet(name: &str, auth_domain: &str, auth_name: &str) -> Packet {
        let mut p = Packet::new();
        p.put_int(Msg::Join.code())
            .put_string(name)
            .put_int(0)
            .put_string("")
            .put_string(auth_domain)
            .put_string(auth_name);
        p
    }
}
