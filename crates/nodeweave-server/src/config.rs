//! Server configuration from the environment.

use nodeweave_core::EngineConfig;
use nodeweave_core::config::DEFAULT_CHANNEL_CAPACITY;
use nodeweave_core::history::DEFAULT_HISTORY_LIMIT;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3030;
const DEFAULT_PRESENCE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory for file storage. Graphs are kept in memory when unset.
    pub data_dir: Option<PathBuf>,
    pub presence_timeout: Duration,
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: None,
            presence_timeout: Duration::from_secs(DEFAULT_PRESENCE_TIMEOUT_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Read `PORT`, `NODEWEAVE_DATA_DIR`, `NODEWEAVE_PRESENCE_TIMEOUT_SECS`
    /// and `NODEWEAVE_HISTORY_LIMIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            data_dir: lookup("NODEWEAVE_DATA_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            presence_timeout: Duration::from_secs(parse_or(
                &lookup,
                "NODEWEAVE_PRESENCE_TIMEOUT_SECS",
                DEFAULT_PRESENCE_TIMEOUT_SECS,
            )),
            history_limit: parse_or(&lookup, "NODEWEAVE_HISTORY_LIMIT", defaults.history_limit),
        }
    }

    /// Engine settings handed to rooms and advertised to clients.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            history_limit: self.history_limit,
            presence_timeout_ms: self.presence_timeout.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// How often stale presence is swept.
    pub fn expiry_tick(&self) -> Duration {
        (self.presence_timeout / 4).max(Duration::from_secs(1))
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}
