//! Ephemeral per-user presence: cursors, colors and node locks.
//!
//! The tracker owns no timer. Whoever drives it calls
//! [`PresenceTracker::expire_stale`] with the current time.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default presence timeout in milliseconds.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 30_000;

/// Presence of one connected user.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub cursor: Point,
    pub locked_node_ids: BTreeSet<String>,
    /// Milliseconds since the Unix epoch of the last heartbeat or update.
    pub last_seen: u64,
}

/// Partial presence change. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<Point>,
    pub locked_node_ids: Option<BTreeSet<String>>,
}

/// Presence broadcast on the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub cursor: Point,
    #[serde(default)]
    pub locked_node_ids: Vec<String>,
    pub timestamp_ms: u64,
}

impl From<&PresenceEntry> for PresenceEvent {
    fn from(entry: &PresenceEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            name: entry.display_name.clone(),
            color: entry.color.clone(),
            cursor: entry.cursor,
            locked_node_ids: entry.locked_node_ids.iter().cloned().collect(),
            timestamp_ms: entry.last_seen,
        }
    }
}

impl From<&PresenceEvent> for PresenceUpdate {
    fn from(event: &PresenceEvent) -> Self {
        Self {
            display_name: Some(event.name.clone()),
            color: Some(event.color.clone()),
            cursor: Some(event.cursor),
            locked_node_ids: Some(event.locked_node_ids.iter().cloned().collect()),
        }
    }
}

/// Presence entries keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    entries: BTreeMap<String, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user_id`, replacing any previous entry.
    pub fn join(&mut self, user_id: &str, update: PresenceUpdate, now_ms: u64) -> &PresenceEntry {
        let entry = PresenceEntry {
            user_id: user_id.to_string(),
            display_name: update.display_name.unwrap_or_else(|| user_id.to_string()),
            color: update.color.unwrap_or_else(|| default_color(user_id)),
            cursor: update.cursor.unwrap_or(Point::ZERO),
            locked_node_ids: update.locked_node_ids.unwrap_or_default(),
            last_seen: now_ms,
        };
        self.entries.insert(user_id.to_string(), entry);
        &self.entries[user_id]
    }

    /// Apply an update and refresh `last_seen`. Unknown users are joined.
    pub fn update(&mut self, user_id: &str, update: PresenceUpdate, now_ms: u64) -> &PresenceEntry {
        if let Some(entry) = self.entries.get_mut(user_id) {
            if let Some(name) = update.display_name {
                entry.display_name = name;
            }
            if let Some(color) = update.color {
                entry.color = color;
            }
            if let Some(cursor) = update.cursor {
                entry.cursor = cursor;
            }
            if let Some(locks) = update.locked_node_ids {
                entry.locked_node_ids = locks;
            }
            entry.last_seen = entry.last_seen.max(now_ms);
        } else {
            return self.join(user_id, update, now_ms);
        }
        &self.entries[user_id]
    }

    /// Mark `user_id` as alive without changing anything else.
    pub fn heartbeat(&mut self, user_id: &str, now_ms: u64) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.last_seen = entry.last_seen.max(now_ms);
                true
            }
            None => false,
        }
    }

    pub fn leave(&mut self, user_id: &str) -> Option<PresenceEntry> {
        self.entries.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// All entries ordered by user id.
    pub fn list(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    /// Remove entries not seen within `timeout_ms` of `now_ms`.
    /// Returns the removed user ids, sorted.
    pub fn expire_stale(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| now_ms.saturating_sub(entry.last_seen) > timeout_ms)
            .map(|entry| entry.user_id.clone())
            .collect();
        for user_id in &expired {
            self.entries.remove(user_id);
            log::debug!("presence expired for {}", user_id);
        }
        expired
    }

    /// User holding a lock on `node_id`, if any. When several users claim
    /// the same node the smallest user id wins.
    pub fn locked_by(&self, node_id: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| entry.locked_node_ids.contains(node_id))
            .map(|entry| entry.user_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stable color derived from the user id.
fn default_color(user_id: &str) -> String {
    const PALETTE: [&str; 8] = [
        "#e03131", "#2f9e44", "#1971c2", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#5c940d",
    ];
    let hash = user_id
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()].to_string()
}
