//! Engine tuning knobs.

use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::presence::DEFAULT_PRESENCE_TIMEOUT_MS;
use serde::{Deserialize, Serialize};

/// Default capacity of a per-graph broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Per-session engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of undo steps per session.
    pub history_limit: usize,
    /// Presence entries older than this are expired.
    pub presence_timeout_ms: u64,
    /// Buffered messages per broadcast subscriber before it lags.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
