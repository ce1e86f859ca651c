//! Map Rotation
//!
//! One map pool per mode family plus a queue of maps players asked for.
//! Queued maps take priority as long as the mode does not change.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::mode::{ModeFamily, ModeId};

/// Map queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// Map is already in the queue.
    #[error("{0} is already queued")]
    AlreadyQueued(String),

    /// Map is not playable in the current mode.
    #[error("{0} is not in the map pool of this mode")]
    NotInPool(String),
}

/// Map names per mode family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapPools {
    /// Deathmatch maps.
    pub deathmatch: Vec<String>,
    /// Flag maps.
    pub ctf: Vec<String>,
    /// Capture maps.
    pub capture: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for MapPools {
    fn default() -> Self {
        Self {
            deathmatch: names(&[
                "complex", "douze", "ot", "academy", "metl2", "metl3", "nmp8", "refuge", "tartech",
                "kalking1", "dock", "turbine", "fanatic_quake", "oddworld", "wake5", "aard3c",
                "curvedm", "fragplaza", "pgdm", "kffa", "neonpanic", "hog2", "memento", "orbe",
            ]),
            ctf: names(&[
                "hallo", "reissen", "flagstone", "tejen", "shipwreck", "capture_night", "l_ctf",
                "forge", "haste", "mill", "berlin_wall", "dust2", "akroseum", "face-capture",
                "valhalla", "urban_c", "bt_falls", "suspended", "abbey", "tortuga", "mercury",
            ]),
            capture: names(&[
                "urban_c", "nevil_c", "fb_capture", "nmp9", "c_valley", "lostinspace",
                "fanatic_quake", "face-capture", "nmp4", "nmp8", "hallo", "monastery",
                "ph-capture", "hades", "fc3", "fc4", "relic", "fc5", "paradigm", "corruption",
            ]),
        }
    }
}

/// Pools plus the player queue.
#[derive(Debug)]
pub struct MapRotation {
    pools: MapPools,
    queue: VecDeque<String>,
    rng: StdRng,
}

impl MapRotation {
    /// Create a rotation over `pools`.
    pub fn new(pools: MapPools) -> Self {
        Self {
            pools,
            queue: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Maps for a mode.
    pub fn pool(&self, mode: ModeId) -> &[String] {
        match mode.family() {
            ModeFamily::Deathmatch => &self.pools.deathmatch,
            ModeFamily::Ctf => &self.pools.ctf,
            ModeFamily::Capture => &self.pools.capture,
        }
    }

    /// True if `map` is in `mode`'s pool.
    pub fn contains(&self, mode: ModeId, map: &str) -> bool {
        self.pool(mode).iter().any(|m| m == map)
    }

    /// Queued maps, next first.
    pub fn queued(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    /// Drop every queued map.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Pick the map to play after `current_map`. A queued map wins while
    /// the mode stays the same; otherwise the pool is walked cyclically,
    /// starting at random when the current map is not in it.
    pub fn next_map(&mut self, mode: ModeId, current_mode: ModeId, current_map: &str) -> Option<String> {
        if mode == current_mode {
            if let Some(map) = self.queue.pop_front() {
                return Some(map);
            }
        }
        let pool = match mode.family() {
            ModeFamily::Deathmatch => &self.pools.deathmatch,
            ModeFamily::Ctf => &self.pools.ctf,
            ModeFamily::Capture => &self.pools.capture,
        };
        match pool.iter().position(|m| m == current_map) {
            Some(i) => pool.get((i + 1) % pool.len()).cloned(),
            None => pool.choose(&mut self.rng).cloned(),
        }
    }

    /// Queue a map for the current mode.
    pub fn queue_map(&mut self, current_mode: ModeId, name: &str) -> Result<(), RotationError> {
        if self.queue.iter().any(|m| m == name) {
            return Err(RotationError::AlreadyQueued(name.to_string()));
        }
        if !self.contains(current_mode, name) {
            return Err(RotationError::NotInPool(name.to_string()));
        }
        self.queue.push_back(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation() -> MapRotation {
        MapRotation::new(MapPools {
            deathmatch: names(&["a", "b", "c"]),
            ctf: names(&["x", "y"]),
            capture: Vec::new(),
        })
    }

    #[test]
    fn test_cycles_through_pool() {
        let mut r = rotation();
        assert_eq!(r.next_map(ModeId::FFA, ModeId::FFA, "a").as_deref(), Some("b"));
        assert_eq!(r.next_map(ModeId::FFA, ModeId::FFA, "c").as_deref(), Some("a"));
        assert_eq!(r.next_map(ModeId::CTF, ModeId::FFA, "x").as_deref(), Some("y"));
    }

    #[test]
    fn test_unknown_map_picks_from_pool() {
        let mut r = rotation();
        for _ in 0..10 {
            let m = r.next_map(ModeId::CTF, ModeId::CTF, "nowhere").unwrap();
            assert!(r.contains(ModeId::CTF, &m));
        }
        assert_eq!(r.next_map(ModeId::CAPTURE, ModeId::CAPTURE, "a"), None);
    }

    #[test]
    fn test_queue_takes_priority() {
        let mut r = rotation();
        r.queue_map(ModeId::FFA, "c").unwrap();
        r.queue_map(ModeId::FFA, "a").unwrap();
        // a mode change leaves the queue alone
        assert_eq!(r.next_map(ModeId::CTF, ModeId::FFA, "a").as_deref(), Some("x"));
        assert_eq!(r.next_map(ModeId::FFA, ModeId::FFA, "a").as_deref(), Some("c"));
        assert_eq!(r.next_map(ModeId::FFA, ModeId::FFA, "c").as_deref(), Some("a"));
        assert_eq!(r.next_map(ModeId::FFA, ModeId::FFA, "a").as_deref(), Some("b"));
    }

    #[test]
    fn test_queue_rejections() {
        let mut r = rotation();
        r.queue_map(ModeId::FFA, "b").unwrap();
        assert_eq!(
            r.queue_map(ModeId::FFA, "b"),
            Err(RotationError::AlreadyQueued("b".into()))
        );
        assert_eq!(
            r.queue_map(ModeId::FFA, "x"),
            Err(RotationError::NotInPool("x".into()))
        );
        r.clear_queue();
        assert_eq!(r.queued().count(), 0);
    }
}
