//! Team Affiliation
//!
//! Teamless modes keep every player unaffiliated; teamed modes split them
//! between "good" and "evil". Spectators belong to neither.

use std::collections::BTreeSet;

use rand::Rng;

/// Name of the first team.
pub const GOOD: &str = "good";

/// Name of the second team.
pub const EVIL: &str = "evil";

/// Maximum team name length.
pub const MAX_TEAM_LEN: usize = 4;

/// One team.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Team {
    /// Team name.
    pub name: String,
    /// Team frags.
    pub frags: i32,
    /// Team score (flags in CTF).
    pub score: i32,
    /// Member client numbers.
    pub players: BTreeSet<u32>,
}

impl Team {
    /// Create an empty team.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Team membership for one match.
#[derive(Clone, Debug, Default)]
pub struct Teams {
    teams: Vec<Team>,
    unaffiliated: BTreeSet<u32>,
    keep_teams: bool,
}

impl Teams {
    /// Teamless affiliation.
    pub fn teamless() -> Self {
        Self::default()
    }

    /// Good vs evil. With `keep_teams` a player keeps the team they bring.
    pub fn teamed(keep_teams: bool) -> Self {
        Self {
            teams: vec![Team::new(GOOD), Team::new(EVIL)],
            unaffiliated: BTreeSet::new(),
            keep_teams,
        }
    }

    /// True for teamed modes.
    pub fn is_teamed(&self) -> bool {
        !self.teams.is_empty()
    }

    /// All teams.
    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    /// Players without a team.
    pub fn unaffiliated(&self) -> &BTreeSet<u32> {
        &self.unaffiliated
    }

    /// Team by name.
    pub fn get(&self, name: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.name == name)
    }

    /// Mutable team by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Team> {
        self.teams.iter_mut().find(|t| t.name == name)
    }

    /// Name of `cn`'s team.
    pub fn team_of(&self, cn: u32) -> Option<&str> {
        self.teams
            .iter()
            .find(|t| t.players.contains(&cn))
            .map(|t| t.name.as_str())
    }

    /// True if `a` and `b` share a team.
    pub fn same_team(&self, a: u32, b: u32) -> bool {
        self.teams
            .iter()
            .any(|t| t.players.contains(&a) && t.players.contains(&b))
    }

    /// Total affiliated plus unaffiliated players.
    pub fn player_count(&self) -> usize {
        self.teams.iter().map(|t| t.players.len()).sum::<usize>() + self.unaffiliated.len()
    }

    /// The team a new player should join: fewest players, then lowest
    /// score, then fewest frags, then a coin flip.
    pub fn weakest<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Team> {
        let mut best: Option<&Team> = None;
        for t in &self.teams {
            best = match best {
                None => Some(t),
                Some(b) => {
                    let key_t = (t.players.len(), t.score, t.frags);
                    let key_b = (b.players.len(), b.score, b.frags);
                    if key_t < key_b || (key_t == key_b && rng.gen_bool(0.5)) {
                        Some(t)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    /// Place a player. `preferred` is the team they bring with them; it is
    /// honoured only with keep-teams set. Returns the chosen team name.
    pub fn join<R: Rng + ?Sized>(&mut self, cn: u32, preferred: &str, rng: &mut R) -> Option<String> {
        self.remove(cn);
        if !self.is_teamed() {
            self.unaffiliated.insert(cn);
            return None;
        }
        let name = if self.keep_teams && self.get(preferred).is_some() {
            preferred.to_string()
        } else {
            self.weakest(rng).map(|t| t.name.clone())?
        };
        self.get_mut(&name)?.players.insert(cn);
        Some(name)
    }

    /// Move a player to a named team. Fails in teamless modes and for
    /// unknown team names.
    pub fn change(&mut self, cn: u32, team: &str) -> bool {
        if self.get(team).is_none() {
            return false;
        }
        self.remove(cn);
        if let Some(t) = self.get_mut(team) {
            t.players.insert(cn);
        }
        true
    }

    /// Remove a player from every team.
    pub fn remove(&mut self, cn: u32) {
        self.unaffiliated.remove(&cn);
        for t in &mut self.teams {
            t.players.remove(&cn);
        }
    }

    /// Add `delta` to a team's frags, returning the new total.
    pub fn add_frags(&mut self, team: &str, delta: i32) -> i32 {
        match self.get_mut(team) {
            Some(t) => {
                t.frags += delta;
                t.frags
            }
            None => 0,
        }
    }

    /// Add `delta` to a team's score, returning the new total.
    pub fn add_score(&mut self, team: &str, delta: i32) -> i32 {
        match self.get_mut(team) {
            Some(t) => {
                t.score += delta;
                t.score
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_teamless_join() {
        let mut t = Teams::teamless();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(t.join(0, GOOD, &mut rng), None);
        assert_eq!(t.team_of(0), None);
        assert_eq!(t.player_count(), 1);
        assert!(!t.same_team(0, 0));
    }

    #[test]
    fn test_balancing_fills_smaller_team() {
        let mut t = Teams::teamed(false);
        let mut rng = StdRng::seed_from_u64(1);
        let a = t.join(0, GOOD, &mut rng).unwrap();
        let b = t.join(1, GOOD, &mut rng).unwrap();
        assert_ne!(a, b);
        let c = t.join(2, GOOD, &mut rng).unwrap();
        let d = t.join(3, GOOD, &mut rng).unwrap();
        assert_ne!(c, d);
        assert_eq!(t.get(GOOD).unwrap().players.len(), 2);
        assert_eq!(t.get(EVIL).unwrap().players.len(), 2);
    }

    #[test]
    fn test_balancing_prefers_lower_score() {
        let mut t = Teams::teamed(false);
        let mut rng = StdRng::seed_from_u64(3);
        t.add_score(EVIL, 2);
        assert_eq!(t.join(0, EVIL, &mut rng).as_deref(), Some(GOOD));
        t.join(1, GOOD, &mut rng);
        t.add_frags(GOOD, 5);
        t.add_score(EVIL, -2);
        assert_eq!(t.join(2, GOOD, &mut rng).as_deref(), Some(EVIL));
    }

    #[test]
    fn test_keep_teams_honours_preference() {
        let mut t = Teams::teamed(true);
        let mut rng = StdRng::seed_from_u64(1);
        t.join(0, EVIL, &mut rng);
        t.join(1, EVIL, &mut rng);
        assert_eq!(t.team_of(1), Some(EVIL));
        assert_eq!(t.join(2, "nope", &mut rng).as_deref(), Some(GOOD));
    }

    #[test]
    fn test_membership_is_exclusive() {
        let mut t = Teams::teamed(false);
        let mut rng = StdRng::seed_from_u64(1);
        t.join(0, GOOD, &mut rng);
        assert!(t.change(0, EVIL));
        assert!(t.change(0, GOOD));
        assert!(!t.change(0, "blue"));
        assert_eq!(t.player_count(), 1);
        t.remove(0);
        assert_eq!(t.player_count(), 0);
    }
}
