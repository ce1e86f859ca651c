//! Ban Registry
//!
//! IPv4 network bans with optional expiry. Each ban belongs to a domain:
//! the empty domain holds local bans (kicks, ban file), any other domain
//! holds global bans pushed by that master server. Expired bans are purged
//! whenever the registry is consulted.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Ban errors.
#[derive(Debug, Error)]
pub enum BanError {
    /// Network could not be parsed.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// Ban file unreadable.
    #[error("cannot read ban file: {0}")]
    Io(#[from] std::io::Error),

    /// Ban file malformed.
    #[error("invalid ban file: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// NETWORK
// =============================================================================

/// IPv4 network in CIDR notation. A bare address is a /32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Net {
    base: u32,
    prefix: u8,
}

impl Ipv4Net {
    /// Network of `addr` with `prefix` leading bits.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, BanError> {
        if prefix > 32 {
            return Err(BanError::InvalidNetwork(format!("{}/{}", addr, prefix)));
        }
        let net = Self { base: 0, prefix };
        Ok(Self {
            base: u32::from(addr) & net.mask(),
            prefix,
        })
    }

    fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    /// True if `addr` lies inside.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == self.base
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Ipv4Net {
    type Err = BanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BanError::InvalidNetwork(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().map_err(|_| invalid())?),
            None => (s, 32),
        };
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Net {
    type Error = BanError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Net> for String {
    fn from(n: Ipv4Net) -> String {
        n.to_string()
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

impl fmt::Debug for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// =============================================================================
// BANS
// =============================================================================

/// One ban.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    /// Banned network.
    pub network: Ipv4Net,
    /// Shown to the rejected player.
    #[serde(default)]
    pub reason: String,
    /// End of the ban; permanent when absent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Issuing domain; empty for local bans.
    #[serde(default)]
    pub domain: String,
}

impl Ban {
    /// True once expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |t| t <= now)
    }
}

/// Thread-safe ban list.
#[derive(Debug, Default)]
pub struct BanManager {
    bans: Mutex<Vec<Ban>>,
}

impl BanManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load local bans from a JSON list.
    pub fn load(&self, path: &Path) -> Result<usize, BanError> {
        let text = std::fs::read_to_string(path)?;
        let bans: Vec<Ban> = serde_json::from_str(&text)?;
        let count = bans.len();
        for ban in bans {
            self.add(ban);
        }
        info!(count, path = %path.display(), "loaded bans");
        Ok(count)
    }

    /// Add a ban.
    pub fn add(&self, ban: Ban) {
        if let Ok(mut bans) = self.bans.lock() {
            bans.push(ban);
        }
    }

    /// Ban `network` locally until `expires_at`.
    pub fn ban(&self, network: Ipv4Net, reason: &str, expires_at: Option<DateTime<Utc>>) {
        self.add(Ban {
            network,
            reason: reason.to_string(),
            expires_at,
            domain: String::new(),
        });
    }

    /// First unexpired ban covering `addr`.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Ban> {
        self.lookup_at(addr, Utc::now())
    }

    /// `lookup` at a given time.
    pub fn lookup_at(&self, addr: Ipv4Addr, now: DateTime<Utc>) -> Option<Ban> {
        let mut bans = self.bans.lock().ok()?;
        bans.retain(|b| !b.is_expired(now));
        bans.iter().find(|b| b.network.contains(addr)).cloned()
    }

    /// Remove every ban of `domain`.
    pub fn clear_domain(&self, domain: &str) {
        if let Ok(mut bans) = self.bans.lock() {
            bans.retain(|b| b.domain != domain);
        }
    }

    /// Number of stored bans, expired ones included.
    pub fn len(&self) -> usize {
        self.bans.lock().map_or(0, |b| b.len())
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_networks() {
        let n: Ipv4Net = "10.1.2.3/8".parse().unwrap();
        assert_eq!(n.to_string(), "10.0.0.0/8");
        assert!(n.contains(ip("10.200.0.1")));
        assert!(!n.contains(ip("11.0.0.1")));

        let single: Ipv4Net = "192.168.0.7".parse().unwrap();
        assert_eq!(single.prefix(), 32);
        assert!(single.contains(ip("192.168.0.7")));
        assert!(!single.contains(ip("192.168.0.8")));

        let all: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(ip("1.2.3.4")));

        assert!("10.0.0.0/33".parse::<Ipv4Net>().is_err());
        assert!("nope".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn test_lookup_and_expiry() {
        let bans = BanManager::new();
        let now = Utc::now();
        bans.ban("1.2.3.0/24".parse().unwrap(), "griefing", Some(now + Duration::hours(4)));
        bans.ban("5.6.7.8".parse().unwrap(), "cheating", None);

        assert_eq!(bans.lookup_at(ip("1.2.3.99"), now).unwrap().reason, "griefing");
        assert!(bans.lookup_at(ip("1.2.4.1"), now).is_none());

        let later = now + Duration::hours(5);
        assert!(bans.lookup_at(ip("1.2.3.99"), later).is_none());
        assert_eq!(bans.len(), 1);
        assert!(bans.lookup_at(ip("5.6.7.8"), later).is_some());
    }

    #[test]
    fn test_domain_scope() {
        let bans = BanManager::new();
        bans.ban("1.0.0.0/8".parse().unwrap(), "", None);
        bans.add(Ban {
            network: "2.0.0.0/8".parse().unwrap(),
            reason: String::new(),
            expires_at: None,
            domain: "master.example.org".into(),
        });
        bans.clear_domain("master.example.org");
        assert!(bans.lookup(ip("2.1.1.1")).is_none());
        assert!(bans.lookup(ip("1.1.1.1")).is_some());
    }

    #[test]
    fn test_ban_file_format() {
        let json = r#"[
            {"network": "10.0.0.0/16", "reason": "abuse", "expires_at": "2030-01-01T00:00:00Z"},
            {"network": "172.16.0.1"}
        ]"#;
        let bans: Vec<Ban> = serde_json::from_str(json).unwrap();
        assert_eq!(bans.len(), 2);
        assert!(bans[0].expires_at.is_some());
        assert_eq!(bans[1].network.prefix(), 32);
        assert!(bans[1].domain.is_empty());
    }
}
