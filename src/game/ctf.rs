//! Capture the Flag
//!
//! Two flags, one per team. A player scores by carrying the enemy flag to
//! their own flag while it sits at base. Every state change bumps the flag
//! version; client actions naming a stale version are ignored.
//!
//! A flag is always in exactly one of three states:
//!
//! ```text
//!   at base:  owner = None,  drop_time = 0
//!   held:     owner = Some,  drop_time = 0
//!   dropped:  owner = None,  drop_time > 0   (reset timer pending)
//! ```

use std::time::Duration;

use tracing::debug;

use crate::core::packet::Packet;
use crate::core::vec3::{Vec3, DMF};
use crate::game::mode::{GameTimer, ModeCtx, ModeEvent};
use crate::game::team::{Teams, EVIL, GOOD};
use crate::network::protocol::{Msg, MESSAGE_CHANNEL};

/// Score that ends the match.
pub const FLAG_LIMIT: i32 = 10;

/// Time until a dropped flag returns to base.
pub const FLAG_RESET_DELAY: Duration = Duration::from_secs(10);

/// Wait between death and respawn in flag modes.
pub const RESPAWN_DELAY_MS: u64 = 5000;

/// Team index of a team name: 1 good, 2 evil.
pub fn team_index(name: &str) -> Option<i32> {
    match name {
        GOOD => Some(1),
        EVIL => Some(2),
        _ => None,
    }
}

/// Team name of a team index.
pub fn team_name(index: i32) -> Option<&'static str> {
    match index {
        1 => Some(GOOD),
        2 => Some(EVIL),
        _ => None,
    }
}

// =============================================================================
// FLAG
// =============================================================================

/// One flag.
#[derive(Clone, Debug, PartialEq)]
pub struct Flag {
    /// Flag index (0 or 1).
    pub index: usize,
    /// Owning team index.
    pub team: i32,
    /// Carrier.
    pub owner: Option<u32>,
    /// Bumped on every state change.
    pub version: i32,
    /// Game time of the drop, 0 unless dropped.
    pub drop_time: u64,
    /// Where the flag was dropped.
    pub drop_location: Vec3,
    /// Base position.
    pub spawn_location: Vec3,
}

impl Flag {
    fn new(index: usize, team: i32, spawn_location: Vec3) -> Self {
        Self {
            index,
            team,
            owner: None,
            version: 0,
            drop_time: 0,
            drop_location: Vec3::ZERO,
            spawn_location,
        }
    }

    /// True if at base.
    pub fn at_base(&self) -> bool {
        self.owner.is_none() && self.drop_time == 0
    }

    /// True if lying on the ground.
    pub fn is_dropped(&self) -> bool {
        self.owner.is_none() && self.drop_time != 0
    }

    fn bump(&mut self) -> i32 {
        self.version += 1;
        self.version
    }

    fn take(&mut self, cn: u32) {
        self.owner = Some(cn);
        self.drop_time = 0;
        self.drop_location = Vec3::ZERO;
        self.bump();
    }

    fn drop_at(&mut self, location: Vec3, now: u64) {
        self.owner = None;
        self.drop_time = now.max(1);
        self.drop_location = location;
        self.bump();
    }

    fn reset(&mut self) {
        self.owner = None;
        self.drop_time = 0;
        self.drop_location = Vec3::ZERO;
        self.bump();
    }
}

// =============================================================================
// FLAG RULES
// =============================================================================

/// Flag state for one CTF match.
#[derive(Clone, Debug, Default)]
pub struct FlagRules {
    flags: Vec<Flag>,
}

impl FlagRules {
    /// No flags until a client reports the map layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the layout is known.
    pub fn is_initialized(&self) -> bool {
        !self.flags.is_empty()
    }

    /// All flags.
    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    /// Flag by index.
    pub fn flag(&self, index: usize) -> Option<&Flag> {
        self.flags.get(index)
    }

    /// Forget the layout (map change).
    pub fn clear(&mut self) {
        self.flags.clear();
    }

    /// Parse a client's flag layout: count, then per flag its team and
    /// base position. Only the first valid two-flag layout is accepted.
    /// Returns `None` on a short read.
    pub fn read_layout(&mut self, p: &mut Packet) -> Option<bool> {
        let count = p.get_int()?;
        let mut parsed = Vec::new();
        for i in 0..count.max(0) {
            let team = p.get_int()?;
            let mut xyz = [0; 3];
            for v in &mut xyz {
                *v = p.get_int()?;
            }
            parsed.push(Flag::new(i as usize, team, Vec3::from_wire(xyz, DMF)));
        }
        if self.is_initialized() {
            return Some(false);
        }
        let valid = parsed.len() == 2
            && parsed.iter().any(|f| f.team == 1)
            && parsed.iter().any(|f| f.team == 2);
        if !valid {
            debug!(count, "rejected flag layout");
            return Some(false);
        }
        self.flags = parsed;
        Some(true)
    }

    fn flag_of_team(&self, team: i32) -> Option<usize> {
        self.flags.iter().position(|f| f.team == team)
    }

    /// Touch a flag. Takes the enemy flag, returns a dropped own flag, or
    /// scores when touching the own flag at base while carrying the enemy
    /// flag.
    pub fn touch(&mut self, ctx: &mut ModeCtx<'_>, teams: &mut Teams, cn: u32, index: usize, version: i32) {
        let Some(client) = ctx.clients.get(cn) else { return };
        if !client.state.is_alive() {
            return;
        }
        let Some(team) = teams.team_of(cn).and_then(team_index) else { return };
        let Some(flag) = self.flags.get(index) else { return };
        if flag.version != version || flag.owner.is_some() {
            return;
        }

        if flag.team != team {
            self.take(ctx, cn, index);
        } else if flag.is_dropped() {
            self.return_flag(ctx, cn, index);
        } else if let Some(relay) = self.flags.iter().position(|f| f.owner == Some(cn)) {
            self.score(ctx, teams, cn, relay, index);
        }
    }

    fn take(&mut self, ctx: &mut ModeCtx<'_>, cn: u32, index: usize) {
        let flag = &mut self.flags[index];
        flag.take(cn);
        ctx.timers.cancel(&GameTimer::FlagReset(index));
        let mut p = Packet::new();
        p.put_int(Msg::TakeFlag.code())
            .put_int(cn as i32)
            .put_int(index as i32)
            .put_int(flag.version);
        ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        debug!(cn, flag = index, "flag taken");
    }

    fn return_flag(&mut self, ctx: &mut ModeCtx<'_>, cn: u32, index: usize) {
        let flag = &mut self.flags[index];
        flag.reset();
        ctx.timers.cancel(&GameTimer::FlagReset(index));
        let mut p = Packet::new();
        p.put_int(Msg::ReturnFlag.code())
            .put_int(cn as i32)
            .put_int(index as i32)
            .put_int(flag.version);
        ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        debug!(cn, flag = index, "flag returned");
    }

    fn score(&mut self, ctx: &mut ModeCtx<'_>, teams: &mut Teams, cn: u32, relay: usize, goal: usize) {
        let team = self.flags[goal].team;
        self.flags[relay].reset();
        self.flags[goal].bump();
        ctx.timers.cancel(&GameTimer::FlagReset(relay));

        let score = team_name(team).map_or(0, |name| teams.add_score(name, 1));
        let carried = match ctx.clients.get_mut(cn) {
            Some(c) => {
                c.state.flags += 1;
                c.state.flags
            }
            None => 0,
        };

        let mut p = Packet::new();
        p.put_int(Msg::ScoreFlag.code())
            .put_int(cn as i32)
            .put_int(relay as i32)
            .put_int(self.flags[relay].version)
            .put_int(goal as i32)
            .put_int(self.flags[goal].version)
            .put_int(-1)
            .put_int(team)
            .put_int(score)
            .put_int(carried);
        ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
        debug!(cn, team, score, "flag scored");

        if score >= FLAG_LIMIT {
            ctx.events.push(ModeEvent::Intermission);
        }
    }

    /// Drop every flag `cn` carries at their last known position and
    /// schedule the resets.
    pub fn drop_flags(&mut self, ctx: &mut ModeCtx<'_>, cn: u32, now: u64) {
        let location = ctx.clients.get(cn).map_or(Vec3::ZERO, |c| c.position);
        for index in 0..self.flags.len() {
            if self.flags[index].owner != Some(cn) {
                continue;
            }
            let flag = &mut self.flags[index];
            flag.drop_at(location, now);
            ctx.timers.schedule(GameTimer::FlagReset(index), FLAG_RESET_DELAY);
            let mut p = Packet::new();
            p.put_int(Msg::DropFlag.code())
                .put_int(cn as i32)
                .put_int(index as i32)
                .put_int(flag.version);
            for v in location.to_wire(DMF) {
                p.put_int(v);
            }
            ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
            debug!(cn, flag = index, "flag dropped");
        }
    }

    /// Return a dropped flag to base after its reset delay.
    pub fn reset_flag(&mut self, ctx: &mut ModeCtx<'_>, teams: &Teams, index: usize) {
        let Some(flag) = self.flags.get_mut(index) else { return };
        if !flag.is_dropped() {
            return;
        }
        flag.reset();
        let score = team_name(flag.team)
            .and_then(|name| teams.get(name))
            .map_or(0, |t| t.score);
        let mut p = Packet::new();
        p.put_int(Msg::ResetFlag.code())
            .put_int(index as i32)
            .put_int(flag.version)
            .put_int(-1)
            .put_int(flag.team)
            .put_int(score);
        ctx.clients.broadcast(None, MESSAGE_CHANNEL, true, &p);
    }

    /// Append the flag layout for a joining client: both team scores, then
    /// per flag its version, spawn index, carrier, visibility and drop
    /// position.
    pub fn write_init(&self, teams: &Teams, p: &mut Packet) {
        p.put_int(Msg::InitFlags.code());
        for name in [GOOD, EVIL] {
            p.put_int(teams.get(name).map_or(0, |t| t.score));
        }
        p.put_int(self.flags.len() as i32);
        for f in &self.flags {
            p.put_int(f.version)
                .put_int(-1)
                .put_int(f.owner.map_or(-1, |cn| cn as i32))
                .put_int(0);
            if f.owner.is_none() {
                p.put_bool(f.drop_time != 0);
                if f.drop_time != 0 {
                    for v in f.drop_location.to_wire(DMF) {
                        p.put_int(v);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mode::testing::Harness;
    use crate::game::state::LifeState;

    fn layout() -> Packet {
        let mut p = Packet::new();
        p.put_int(2);
        p.put_int(1).put_int(0).put_int(0).put_int(0);
        p.put_int(2).put_int(1600).put_int(1600).put_int(0);
        Packet::from_bytes(p.into_bytes())
    }

    fn setup() -> (Harness, FlagRules, Teams) {
        let mut h = Harness::new(2);
        let mut teams = Teams::teamed(false);
        teams.change(0, GOOD);
        teams.change(1, EVIL);
        for cn in 0..2 {
            h.clients.get_mut(cn).unwrap().state.life = LifeState::Alive;
        }
        let mut rules = FlagRules::new();
        assert_eq!(rules.read_layout(&mut layout()), Some(true));
        (h, rules, teams)
    }

    fn check_states(rules: &FlagRules) {
        for f in rules.flags() {
            let states = [f.at_base(), f.owner.is_some(), f.is_dropped()];
            assert_eq!(states.iter().filter(|s| **s).count(), 1, "{:?}", f);
            if f.owner.is_some() {
                assert_eq!(f.drop_time, 0);
            }
        }
    }

    #[test]
    fn test_layout_requires_two_flags() {
        let mut rules = FlagRules::new();
        let mut p = Packet::new();
        p.put_int(1).put_int(1).put_int(0).put_int(0).put_int(0);
        let mut p = Packet::from_bytes(p.into_bytes());
        assert_eq!(rules.read_layout(&mut p), Some(false));
        assert!(!rules.is_initialized());

        let mut short = Packet::from_bytes(vec![2, 1, 0]);
        assert_eq!(rules.read_layout(&mut short), None);

        assert_eq!(rules.read_layout(&mut layout()), Some(true));
        assert_eq!(rules.read_layout(&mut layout()), Some(false));
        assert_eq!(rules.flag(1).unwrap().spawn_location, Vec3::new(100.0, 100.0, 0.0));
    }

    #[test]
    fn test_capture_scores_and_resets() {
        let (mut h, mut rules, mut teams) = setup();
        check_states(&rules);

        // good player takes the evil flag
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        assert_eq!(rules.flag(1).unwrap().owner, Some(0));
        assert_eq!(rules.flag(1).unwrap().version, 1);
        check_states(&rules);

        // brings it to the own flag at base
        rules.touch(&mut h.ctx(), &mut teams, 0, 0, 0);
        assert_eq!(teams.get(GOOD).unwrap().score, 1);
        assert_eq!(h.clients.get(0).unwrap().state.flags, 1);
        assert!(rules.flag(0).unwrap().at_base());
        assert!(rules.flag(1).unwrap().at_base());
        assert_eq!(rules.flag(0).unwrap().version, 1);
        assert_eq!(rules.flag(1).unwrap().version, 2);
        check_states(&rules);

        let score_msg = h.sent_to(1).into_iter().find(|m| m[0] == Msg::ScoreFlag.code() as u8);
        assert_eq!(score_msg.unwrap(), vec![85, 0, 1, 2, 0, 1, 0xFF, 1, 1, 1]);
        assert!(h.events.is_empty());
    }

    #[test]
    fn test_stale_version_ignored() {
        let (mut h, mut rules, mut teams) = setup();
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 5);
        assert!(rules.flag(1).unwrap().at_base());
    }

    #[test]
    fn test_dead_player_cannot_take() {
        let (mut h, mut rules, mut teams) = setup();
        h.clients.get_mut(0).unwrap().state.life = LifeState::Dead;
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        assert!(rules.flag(1).unwrap().at_base());
    }

    #[test]
    fn test_drop_return_and_reset() {
        let (mut h, mut rules, mut teams) = setup();
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        h.clients.get_mut(0).unwrap().position = Vec3::new(10.0, 20.0, 30.0);
        rules.drop_flags(&mut h.ctx(), 0, 0);
        let flag = rules.flag(1).unwrap();
        assert!(flag.is_dropped());
        assert_eq!(flag.drop_location, Vec3::new(10.0, 20.0, 30.0));
        assert!(h.timers.contains(&GameTimer::FlagReset(1)));
        check_states(&rules);

        // evil player returns their dropped flag
        rules.touch(&mut h.ctx(), &mut teams, 1, 1, 2);
        assert!(rules.flag(1).unwrap().at_base());
        assert!(!h.timers.contains(&GameTimer::FlagReset(1)));

        // drop again and let it reset
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 3);
        rules.drop_flags(&mut h.ctx(), 0, 50);
        rules.reset_flag(&mut h.ctx(), &teams, 1);
        assert!(rules.flag(1).unwrap().at_base());
        check_states(&rules);
    }

    #[test]
    fn test_dropped_enemy_flag_can_be_taken() {
        let (mut h, mut rules, mut teams) = setup();
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        rules.drop_flags(&mut h.ctx(), 0, 100);
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 2);
        assert_eq!(rules.flag(1).unwrap().owner, Some(0));
        assert!(!h.timers.contains(&GameTimer::FlagReset(1)));
    }

    #[test]
    fn test_flag_limit_ends_match() {
        let (mut h, mut rules, mut teams) = setup();
        teams.add_score(GOOD, FLAG_LIMIT - 1);
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        rules.touch(&mut h.ctx(), &mut teams, 0, 0, 0);
        assert_eq!(h.events, vec![ModeEvent::Intermission]);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let (mut h, mut rules, mut teams) = setup();
        let mut last = rules.flag(1).unwrap().version;
        for round in 0..5u64 {
            let v = rules.flag(1).unwrap().version;
            rules.touch(&mut h.ctx(), &mut teams, 0, 1, v);
            rules.drop_flags(&mut h.ctx(), 0, round + 1);
            rules.reset_flag(&mut h.ctx(), &teams, 1);
            let now = rules.flag(1).unwrap().version;
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_init_layout() {
        let (mut h, mut rules, mut teams) = setup();
        rules.touch(&mut h.ctx(), &mut teams, 0, 1, 0);
        let mut p = Packet::new();
        rules.write_init(&teams, &mut p);
        assert_eq!(
            p.as_bytes(),
            &[86, 0, 0, 2, 0, 0xFF, 0xFF, 0, 0, 1, 0xFF, 0, 0]
        );
    }
}
