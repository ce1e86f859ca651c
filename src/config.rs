//! Server Configuration
//!
//! Loaded from a JSON file; any field may be missing and falls back to its
//! default. `SAUER_*` environment variables override individual values:
//!
//! | Variable | Field |
//! |---|---|
//! | `SAUER_LISTEN_ADDR` | `listen_addr` |
//! | `SAUER_PORT` | `listen_port` |
//! | `SAUER_MAX_CLIENTS` | `max_clients` |
//! | `SAUER_DESCRIPTION` | `description` |
//! | `SAUER_MOTD` | `motd` |
//! | `SAUER_AUTH_DOMAIN` | `auth_domain` |
//! | `SAUER_MASTER` | `master_server` |
//! | `SAUER_STATS_SERVER` | `stats_server` |
//! | `SAUER_STATS_DOMAIN` | `stats_auth_domain` |
//! | `SAUER_MODE` | `fallback_mode` (name or number) |
//! | `SAUER_DURATION` | `match_duration_secs` |
//! | `SAUER_COMPETITIVE` | `competitive` |
//! | `SAUER_KEEP_TEAMS` | `keep_teams` |
//! | `SAUER_REPORT_STATS` | `report_stats` |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::mode::{ModeId, ModeSettings};
use crate::game::rotation::MapPools;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file unreadable.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },

    /// Config file malformed.
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    /// Environment override could not be parsed.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },

    /// Setting out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen_addr: IpAddr,
    /// Game port; server info queries use the next port.
    pub listen_port: u16,
    /// Player limit.
    pub max_clients: usize,
    /// Name shown in server browsers.
    pub description: String,
    /// Message of the day, sent after joining.
    pub motd: String,
    /// Primary auth domain; its users may claim privileges.
    pub auth_domain: String,
    /// Master server `host:port`.
    pub master_server: Option<String>,
    /// Stats server `host:port`.
    pub stats_server: Option<String>,
    /// Auth domain served by the stats server.
    pub stats_auth_domain: String,
    /// Mode started at boot and when the server empties.
    pub fallback_mode: ModeId,
    /// Match length in seconds.
    pub match_duration_secs: u64,
    /// Start matches under the competitive policy.
    pub competitive: bool,
    /// Players keep the team they bring.
    pub keep_teams: bool,
    /// Report match results to the stats server.
    pub report_stats: bool,
    /// Map rotation.
    pub maps: MapPools,
    /// Users file (JSON list).
    pub users_file: Option<PathBuf>,
    /// Bans file (JSON list).
    pub bans_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 28785,
            max_clients: 16,
            description: String::new(),
            motd: String::new(),
            auth_domain: String::new(),
            master_server: None,
            stats_server: None,
            stats_auth_domain: String::new(),
            fallback_mode: ModeId::EFFIC_CTF,
            match_duration_secs: 600,
            competitive: false,
            keep_teams: false,
            report_stats: true,
            maps: MapPools::default(),
            users_file: None,
            bans_file: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl ServerConfig {
    /// Read `path` (defaults if `None`), apply the environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SAUER_*` overrides looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("SAUER_LISTEN_ADDR") {
            self.listen_addr = parse("SAUER_LISTEN_ADDR", &v)?;
        }
        if let Some(v) = var("SAUER_PORT") {
            self.listen_port = parse("SAUER_PORT", &v)?;
        }
        if let Some(v) = var("SAUER_MAX_CLIENTS") {
            self.max_clients = parse("SAUER_MAX_CLIENTS", &v)?;
        }
        if let Some(v) = var("SAUER_DESCRIPTION") {
            self.description = v;
        }
        if let Some(v) = var("SAUER_MOTD") {
            self.motd = v;
        }
        if let Some(v) = var("SAUER_AUTH_DOMAIN") {
            self.auth_domain = v;
        }
        if let Some(v) = var("SAUER_MASTER") {
            self.master_server = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = var("SAUER_STATS_SERVER") {
            self.stats_server = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = var("SAUER_STATS_DOMAIN") {
            self.stats_auth_domain = v;
        }
        if let Some(v) = var("SAUER_MODE") {
            self.fallback_mode = ModeId::from_name(v.trim()).ok_or_else(|| ConfigError::InvalidValue {
                key: "SAUER_MODE".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = var("SAUER_DURATION") {
            self.match_duration_secs = parse("SAUER_DURATION", &v)?;
        }
        if let Some(v) = var("SAUER_COMPETITIVE") {
            self.competitive = parse_bool("SAUER_COMPETITIVE", &v)?;
        }
        if let Some(v) = var("SAUER_KEEP_TEAMS") {
            self.keep_teams = parse_bool("SAUER_KEEP_TEAMS", &v)?;
        }
        if let Some(v) = var("SAUER_REPORT_STATS") {
            self.report_stats = parse_bool("SAUER_REPORT_STATS", &v)?;
        }
        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 || self.max_clients > 128 {
            return Err(ConfigError::Invalid(format!(
                "max_clients must be 1..=128, got {}",
                self.max_clients
            )));
        }
        if !self.fallback_mode.is_supported() {
            return Err(ConfigError::Invalid(format!(
                "unsupported fallback mode {:?}",
                self.fallback_mode
            )));
        }
        if self.match_duration_secs == 0 {
            return Err(ConfigError::Invalid("match_duration_secs must be positive".into()));
        }
        if self.listen_port == u16::MAX {
            return Err(ConfigError::Invalid("listen_port leaves no room for the info port".into()));
        }
        Ok(())
    }

    /// Game socket address.
    pub fn game_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// Server info socket address.
    pub fn info_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port.saturating_add(1))
    }

    /// Settings for new matches.
    pub fn mode_settings(&self) -> ModeSettings {
        ModeSettings {
            duration: Duration::from_secs(self.match_duration_secs),
            competitive: self.competitive,
            keep_teams: self.keep_teams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen_port": 10000, "fallback_mode": 3}"#).unwrap();
        assert_eq!(config.listen_port, 10000);
        assert_eq!(config.fallback_mode, ModeId::INSTA);
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.info_addr().port(), 10001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("SAUER_PORT", "20000"),
                ("SAUER_MODE", "instactf"),
                ("SAUER_COMPETITIVE", "yes"),
                ("SAUER_MASTER", "master.example.org:28787"),
            ]))
            .unwrap();
        assert_eq!(config.listen_port, 20000);
        assert_eq!(config.fallback_mode, ModeId::INSTA_CTF);
        assert!(config.competitive);
        assert!(config.mode_settings().competitive);
        assert_eq!(config.master_server.as_deref(), Some("master.example.org:28787"));
    }

    #[test]
    fn test_bad_values() {
        let mut config = ServerConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("SAUER_PORT", "lots")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(config.apply_env(env(&[("SAUER_KEEP_TEAMS", "maybe")])).is_err());

        config.fallback_mode = ModeId::CAPTURE;
        assert!(config.validate().is_err());
        config.fallback_mode = ModeId::FFA;
        config.max_clients = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/sauer.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
