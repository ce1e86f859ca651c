//! Game Modes
//!
//! A mode is assembled from fragments: a clock, team affiliation, a spawn
//! kit, optional flag rules and an optional competitive policy. The server
//! talks to one `GameMode` and never to the fragments directly.
//!
//! ## Competitive policy
//!
//! ```text
//!   start ──▶ paused, waiting for every player to load the map
//!               │ last confirm_spawn
//!               ▼
//!   running ◀── countdown 3, 2, 1 ◀── manual resume
//!      │
//!      └── non-spectator leaves ──▶ paused ("a player left the game")
//! ```
//!
//! A pause during the countdown cancels it.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::packet::Packet;
use crate::core::timer::TimerQueue;
use crate::game::clock::Clock;
use crate::game::ctf::{FlagRules, RESPAWN_DELAY_MS};
use crate::game::kit::SpawnKit;
use crate::game::team::Teams;
use crate::network::client::Client;
use crate::network::clients::ClientManager;
use crate::network::protocol::{Msg, MESSAGE_CHANNEL};

/// Delay between countdown steps.
pub const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

// =============================================================================
// MODE IDS
// =============================================================================

/// Family a mode draws its maps from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModeFamily {
    /// Frag-based modes.
    Deathmatch,
    /// Flag modes.
    Ctf,
    /// Base capture modes.
    Capture,
}

/// Game mode id as sent on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeId(pub i32);

impl ModeId {
    /// Free for all.
    pub const FFA: ModeId = ModeId(0);
    /// Teamplay.
    pub const TEAMPLAY: ModeId = ModeId(2);
    /// Instagib.
    pub const INSTA: ModeId = ModeId(3);
    /// Instagib team.
    pub const INSTA_TEAM: ModeId = ModeId(4);
    /// Efficiency.
    pub const EFFIC: ModeId = ModeId(5);
    /// Efficiency team.
    pub const EFFIC_TEAM: ModeId = ModeId(6);
    /// Tactics.
    pub const TACTICS: ModeId = ModeId(7);
    /// Tactics team.
    pub const TACTICS_TEAM: ModeId = ModeId(8);
    /// Capture.
    pub const CAPTURE: ModeId = ModeId(9);
    /// Regen capture.
    pub const REGEN_CAPTURE: ModeId = ModeId(10);
    /// Capture the flag.
    pub const CTF: ModeId = ModeId(11);
    /// Instagib CTF.
    pub const INSTA_CTF: ModeId = ModeId(12);
    /// Efficiency CTF.
    pub const EFFIC_CTF: ModeId = ModeId(17);

    const NAMES: [&'static str; 18] = [
        "ffa",
        "coop",
        "teamplay",
        "insta",
        "instateam",
        "effic",
        "efficteam",
        "tac",
        "tacteam",
        "capture",
        "regencapture",
        "ctf",
        "instactf",
        "protect",
        "instaprotect",
        "hold",
        "instahold",
        "efficctf",
    ];

    /// Short name.
    pub fn name(self) -> &'static str {
        usize::try_from(self.0)
            .ok()
            .and_then(|i| Self::NAMES.get(i).copied())
            .unwrap_or("unknown")
    }

    /// Look up a mode by short name or number.
    pub fn from_name(name: &str) -> Option<ModeId> {
        if let Ok(n) = name.parse::<i32>() {
            return Some(ModeId(n));
        }
        Self::NAMES
            .iter()
            .position(|&n| n == name)
            .map(|i| ModeId(i as i32))
    }

    /// True if this server can run the mode.
    pub fn is_supported(self) -> bool {
        matches!(self.0, 0 | 2..=8 | 11 | 12 | 17)
    }

    /// True for team modes.
    pub fn is_teamed(self) -> bool {
        matches!(self.0, 2 | 4 | 6 | 8 | 9 | 10 | 11 | 12 | 17)
    }

    /// True for flag modes.
    pub fn is_ctf(self) -> bool {
        matches!(self.0, 11 | 12 | 17)
    }

    /// Spawn loadout.
    pub fn kit(self) -> SpawnKit {
        match self.0 {
            3 | 4 | 12 => SpawnKit::Instagib,
            5 | 6 | 17 => SpawnKit::Efficiency,
            7 | 8 => SpawnKit::Tactics,
            _ => SpawnKit::Default,
        }
    }

    /// Map pool family.
    pub fn family(self) -> ModeFamily {
        match self.0 {
            11 | 12 | 17 => ModeFamily::Ctf,
            9 | 10 => ModeFamily::Capture,
            _ => ModeFamily::Deathmatch,
        }
    }
}

impl fmt::Debug for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Timers a mode schedules on the server's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GameTimer {
    /// Return a dropped flag to base.
    FlagReset(usize),
    /// Next step of the resume countdown; 0 resumes.
    Countdown(u8),
    /// Start the next map after intermission.
    NextMap,
}

/// Things a mode asks the server to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeEvent {
    /// End the match now.
    Intermission,
}

/// Server state a mode may touch.
pub struct ModeCtx<'a> {
    /// Connected clients.
    pub clients: &'a mut ClientManager,
    /// Server timer queue.
    pub timers: &'a mut TimerQueue<GameTimer>,
    /// Requests back to the server.
    pub events: &'a mut Vec<ModeEvent>,
}

/// Settings a mode is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeSettings {
    /// Match length.
    pub duration: Duration,
    /// Run under the competitive policy.
    pub competitive: bool,
    /// Players keep the team they bring.
    pub keep_teams: bool,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(600),
            competitive: false,
            keep_teams: false,
        }
    }
}

#[derive(Debug, Default)]
struct Competitive {
    map_load_pending: BTreeSet<u32>,
    waiting_for_load: bool,
}

fn pause_packet(paused: bool, by: Option<u32>) -> Packet {
    let mut p = Packet::new();
    p.put_int(Msg::PauseGame.code())
        .put_bool(paused)
        .put_int(by.map_or(-1, |cn| cn as i32));
    p
}

// =============================================================================
// GAME MODE
// =============================================================================

/// One running match.
#[derive(Debug)]
pub struct GameMode {
    id: ModeId,
    clock: Clock,
    teams: Teams,
    kit: SpawnKit,
    flags: Option<FlagRules>,
    competitive: Option<Competitive>,
    rng: StdRng,
}

impl GameMode {
    /// Assemble a mode. Returns `None` for unsupported ids.
    pub fn new(id: ModeId, settings: &ModeSettings) -> Option<Self> {
        if !id.is_supported() {
            return None;
        }
        Some(Self {
            id,
            clock: Clock::new(settings.duration),
            teams: if id.is_teamed() {
                Teams::teamed(settings.keep_teams)
            } else {
                Teams::teamless()
            },
            kit: id.kit(),
            flags: id.is_ctf().then(FlagRules::new),
            competitive: settings.competitive.then(Competitive::default),
            rng: StdRng::from_entropy(),
        })
    }

    /// Mode id.
    pub fn id(&self) -> ModeId {
        self.id
    }

    /// True while the mode still needs map data from a client.
    pub fn needs_map_info(&self) -> bool {
        self.flags.as_ref().map_or(false, |f| !f.is_initialized())
    }

    /// True under the competitive policy.
    pub fn is_competitive(&self) -> bool {
        self.competitive.is_some()
    }

    /// Team membership.
    pub fn teams(&self) -> &Teams {
        &self.teams
    }

    /// Flag state in flag modes.
    pub fn flags(&self) -> Option<&FlagRules> {
        self.flags.as_ref()
    }

    /// Match clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.clock.is_paused()
    }

    /// Time left in the match.
    pub fn time_left(&self) -> Duration {
        self.clock.time_left()
    }

    /// Game time in milliseconds. Stands still while paused.
    pub fn millis(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Wait for the next clock tick.
    pub async fn next_tick(&mut self) {
        self.clock.next_tick().await;
    }

    /// Count one clock tick down. True when the match time is up.
    pub fn advance_clock(&mut self) -> bool {
        self.clock.advance()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the match clock. Competitive matches hold until every player
    /// has loaded the map.
    pub fn start(&mut self, ctx: &mut ModeCtx<'_>) {
        self.clock.start();
        let Some(comp) = self.competitive.as_mut() else { return };
        comp.map_load_pending = ctx
            .clients
            .joined()
            .filter(|c| !c.state.is_spectator())
            .map(|c| c.cn)
            .collect();
        if comp.map_load_pending.is_empty() {
            return;
        }
        comp.waiting_for_load = true;
        self.pause(ctx, None);
        ctx.clients
            .broadcast_server_message("waiting for all players to load the map");
    }

    /// Stop the clock and drop this mode's timers.
    pub fn end(&mut self, ctx: &mut ModeCtx<'_>) {
        self.clock.stop();
        ctx.timers
            .cancel_where(|t| matches!(t, GameTimer::FlagReset(_) | GameTimer::Countdown(_)));
    }

    /// Pause the clock and any pending flag resets. Cancels a running resume
    /// countdown.
    pub fn pause(&mut self, ctx: &mut ModeCtx<'_>, by: Option<u32>) {
        ctx.timers.cancel_where(|t| matches!(t, GameTimer::Countdown(_)));
        if !self.clock.is_running() || self.clock.is_paused() {
            return;
        }
        self.clock.pause();
        ctx.timers.pause_where(|t| matches!(t, GameTimer::FlagReset(_)));
        ctx.clients
            .broadcast(None, MESSAGE_CHANNEL, true, &pause_packet(true, by));
        info!(mode = %self.id, "game paused");
    }

    /// Resume. Competitive matches count down first.
    pub fn resume(&mut self, ctx: &mut ModeCtx<'_>, by: Option<u32>) {
        if !self.clock.is_paused() {
            return;
        }
        if self.competitive.is_some() {
            let counting = (0..=3).any(|n| ctx.timers.contains(&GameTimer::Countdown(n)));
            if !counting {
                self.countdown(ctx, 3);
            }
            return;
        }
        self.resume_now(ctx, by);
    }

    /// Resume without a countdown.
    pub fn resume_now(&mut self, ctx: &mut ModeCtx<'_>, by: Option<u32>) {
        ctx.timers.cancel_where(|t| matches!(t, GameTimer::Countdown(_)));
        if let Some(comp) = self.competitive.as_mut() {
            comp.waiting_for_load = false;
        }
        if !self.clock.is_paused() {
            return;
        }
        self.clock.resume();
        ctx.timers.resume_where(|t| matches!(t, GameTimer::FlagReset(_)));
        ctx.clients
            .broadcast(None, MESSAGE_CHANNEL, true, &pause_packet(false, by));
        info!(mode = %self.id, "game resumed");
    }

    fn countdown(&mut self, ctx: &mut ModeCtx<'_>, step: u8) {
        if step == 0 {
            self.resume_now(ctx, None);
            return;
        }
        ctx.clients
            .broadcast_server_message(&format!("resuming in {}", step));
        ctx.timers
            .schedule(GameTimer::Countdown(step - 1), COUNTDOWN_STEP);
    }

    /// Handle a mode timer.
    pub fn on_timer(&mut self, ctx: &mut ModeCtx<'_>, timer: GameTimer) {
        match timer {
            GameTimer::FlagReset(index) => {
                if let Some(flags) = self.flags.as_mut() {
                    flags.reset_flag(ctx, &self.teams, index);
                }
            }
            GameTimer::Countdown(step) => self.countdown(ctx, step),
            GameTimer::NextMap => {}
        }
    }

    // -------------------------------------------------------------------------
    // Players
    // -------------------------------------------------------------------------

    /// Place a joining player in a team. Spectators stay unaffiliated.
    pub fn join(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        let Some(client) = ctx.clients.get_mut(cn) else { return };
        if client.state.is_spectator() {
            return;
        }
        if let Some(team) = self.teams.join(cn, &client.team, &mut self.rng) {
            client.team = team;
        }
    }

    /// Remove a leaving player. Under the competitive policy a leaving
    /// player pauses the match.
    pub fn leave(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        let playing = ctx
            .clients
            .get(cn)
            .map_or(false, |c| !c.state.is_spectator());
        self.withdraw(ctx, cn);
        let Some(comp) = self.competitive.as_mut() else { return };
        comp.map_load_pending.remove(&cn);
        if playing && self.clock.is_running() {
            comp.waiting_for_load = false;
            self.pause(ctx, None);
            ctx.clients.broadcast_server_message("a player left the game");
        }
    }

    /// A player switched to spectator.
    pub fn spectate(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        self.withdraw(ctx, cn);
        self.loaded(ctx, cn);
    }

    fn withdraw(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        let now = self.millis();
        if let Some(flags) = self.flags.as_mut() {
            flags.drop_flags(ctx, cn, now);
        }
        self.teams.remove(cn);
    }

    /// Move a player to another team.
    pub fn change_team(&mut self, ctx: &mut ModeCtx<'_>, cn: u32, team: &str) -> bool {
        if !self.teams.is_teamed() || self.teams.get(team).is_none() {
            return false;
        }
        let now = self.millis();
        if let Some(flags) = self.flags.as_mut() {
            flags.drop_flags(ctx, cn, now);
        }
        if !self.teams.change(cn, team) {
            return false;
        }
        if let Some(c) = ctx.clients.get_mut(cn) {
            c.team = team.to_string();
        }
        true
    }

    /// True if the player may respawn now.
    pub fn can_spawn(&self, client: &Client) -> bool {
        if self.flags.is_none() {
            return true;
        }
        let last_death = client.state.last_death;
        last_death == 0 || self.millis() >= last_death + RESPAWN_DELAY_MS
    }

    /// Grant a new life and arm it with this mode's kit.
    pub fn spawn(&mut self, client: &mut Client) {
        client.state.begin_spawn(self.millis());
        self.kit.apply(&mut client.state, &mut self.rng);
    }

    /// A player confirmed their spawn.
    pub fn confirm_spawn(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        self.loaded(ctx, cn);
    }

    fn loaded(&mut self, ctx: &mut ModeCtx<'_>, cn: u32) {
        let Some(comp) = self.competitive.as_mut() else { return };
        if !comp.map_load_pending.remove(&cn) {
            return;
        }
        if comp.waiting_for_load && comp.map_load_pending.is_empty() {
            debug!("all players loaded the map");
            self.resume_now(ctx, None);
        }
    }

    /// Credit a frag. The victim dies; self-kills and team kills cost the
    /// actor a frag. Returns the actor's frags and team frags.
    pub fn frag(&mut self, ctx: &mut ModeCtx<'_>, actor: u32, victim: u32) -> (i32, i32) {
        let now = self.millis();
        if let Some(v) = ctx.clients.get_mut(victim) {
            v.state.die(now);
        }
        let team_kill = actor != victim && self.teams.same_team(actor, victim);
        let value = if actor == victim || team_kill { -1 } else { 1 };
        let frags = match ctx.clients.get_mut(actor) {
            Some(a) => {
                a.state.frags += value;
                if team_kill {
                    a.state.teamkills += 1;
                }
                a.state.frags
            }
            None => 0,
        };
        let team_frags = match self.teams.team_of(actor).map(str::to_owned) {
            Some(team) => self.teams.add_frags(&team, value),
            None => 0,
        };
        (frags, team_frags)
    }

    /// After a death has been announced: drop carried flags.
    pub fn died(&mut self, ctx: &mut ModeCtx<'_>, victim: u32) {
        let now = self.millis();
        if let Some(flags) = self.flags.as_mut() {
            flags.drop_flags(ctx, victim, now);
        }
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Handle a mode message. `Some(true)` if consumed, `Some(false)` if the
    /// message is not a mode message, `None` on a short read.
    pub fn handle_packet(&mut self, ctx: &mut ModeCtx<'_>, cn: u32, msg: Msg, p: &mut Packet) -> Option<bool> {
        match msg {
            Msg::TakeFlag => {
                let index = p.get_int()?;
                let version = p.get_int()?;
                if let (Some(flags), Ok(index)) = (self.flags.as_mut(), usize::try_from(index)) {
                    flags.touch(ctx, &mut self.teams, cn, index, version);
                }
                Some(true)
            }
            Msg::TryDropFlag => {
                let now = self.millis();
                if let Some(flags) = self.flags.as_mut() {
                    flags.drop_flags(ctx, cn, now);
                }
                Some(true)
            }
            Msg::InitFlags => {
                match self.flags.as_mut() {
                    Some(flags) => {
                        if flags.read_layout(p)? {
                            let mut init = Packet::new();
                            flags.write_init(&self.teams, &mut init);
                            ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &init);
                            debug!(cn, "flag layout received");
                        }
                    }
                    None => {
                        FlagRules::new().read_layout(p)?;
                    }
                }
                Some(true)
            }
            _ => Some(false),
        }
    }

    /// Append mode state for a joining client.
    pub fn write_init(&self, p: &mut Packet) {
        if let Some(flags) = self.flags.as_ref().filter(|f| f.is_initialized()) {
            flags.write_init(&self.teams, p);
        }
    }
}

// =============================================================================
// TEST HARNESS
// =============================================================================
