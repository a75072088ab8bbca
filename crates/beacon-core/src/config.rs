//! Configuration system for Beacon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BEACON_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/beacon/config.toml
//!   3. ~/.config/beacon/config.toml

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default primary tracker port.
pub const DEFAULT_PORT: u16 = 53;
/// Default secondary tracker port, for clients whose networks block 53.
pub const DEFAULT_SECONDARY_PORT: u16 = 5300;
/// Default subscriber-store TTL in seconds.
pub const DEFAULT_SUBSCRIBER_TTL_SECS: u64 = 60;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// DNS suffix under which topics are published.
    pub domain: String,
    /// Tracker addresses, `host[:port[,secondaryPort]]`.
    pub trackers: Vec<String>,
    /// Peer-store entry lifetime in seconds. 0 = never expire.
    pub ttl_secs: u64,
    /// Peer-store size cap across all topics. 0 = unlimited.
    pub limit: usize,
    /// Subscriber-store entry lifetime in seconds.
    pub subscriber_ttl_secs: u64,
    /// Subscriber-store size cap. 0 = unlimited.
    pub subscriber_limit: usize,
    /// Announce with port "0" so trackers use the observed source port.
    pub implied_port: bool,
    /// Also discover over link-local multicast DNS.
    pub multicast: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            domain: "dns-discovery.local".to_string(),
            trackers: Vec::new(),
            ttl_secs: 0,
            limit: 10_000,
            subscriber_ttl_secs: DEFAULT_SUBSCRIBER_TTL_SECS,
            subscriber_limit: 10_000,
            implied_port: false,
            multicast: true,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid tracker address '{0}': {1}")]
    BadTracker(String, &'static str),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Tracker addresses ─────────────────────────────────────────────────────────

/// One configured tracker: a host plus primary and secondary ports.
///
/// The secondary port exists because trackers commonly listen on both 53 and
/// 5300. After the first successful probe the winning port is promoted and
/// the secondary cleared; `0` means "no secondary".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddr {
    pub host: String,
    pub port: u16,
    pub secondary_port: u16,
}

impl FromStr for TrackerAddr {
    type Err = ConfigError;

    /// Parse `host[:port[,secondaryPort]]`. Missing ports default to
    /// 53 / 5300. `,0` disables the secondary.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why| ConfigError::BadTracker(s.to_string(), why);
        let (host, ports) = match s.split_once(':') {
            Some((host, ports)) => (host, Some(ports)),
            None => (s, None),
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let (port, secondary_port) = match ports {
            None => (DEFAULT_PORT, DEFAULT_SECONDARY_PORT),
            Some(ports) => {
                let (primary, secondary) = match ports.split_once(',') {
                    Some((primary, secondary)) => (primary, Some(secondary)),
                    None => (ports, None),
                };
                let port = primary
                    .parse::<u16>()
                    .map_err(|_| bad("unparseable port"))?;
                let secondary_port = match secondary {
                    Some(secondary) => secondary
                        .parse::<u16>()
                        .map_err(|_| bad("unparseable secondary port"))?,
                    None => DEFAULT_SECONDARY_PORT,
                };
                (port, secondary_port)
            }
        };
        Ok(Self {
            host: host.to_string(),
            port,
            secondary_port,
        })
    }
}

impl DiscoveryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DiscoveryConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BEACON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Parse the configured tracker strings.
    pub fn tracker_addrs(&self) -> Result<Vec<TrackerAddr>, ConfigError> {
        self.trackers.iter().map(|s| s.parse()).collect()
    }

    /// Apply BEACON_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BEACON_DOMAIN") {
            self.domain = v;
        }
        if let Ok(v) = std::env::var("BEACON_TRACKERS") {
            self.trackers = v.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("BEACON_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("BEACON_MULTICAST") {
            self.multicast = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BEACON_IMPLIED_PORT") {
            self.implied_port = v == "true" || v == "1";
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("beacon")
}
