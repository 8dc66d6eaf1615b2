//! Ephemeral presence state shared between clients of one document.
//!
//! Entries are keyed by the transient client id of a session, not by the
//! user: the same user attached twice shows up as two clients. Remote
//! entries resolve by last-writer-wins on the sender's wall clock and
//! expire when no heartbeat refreshed them within the timeout.
//!
//! ```text
//! set_local() ──► dirty ──► take_dirty() ──► AwarenessUpdate ──► peers
//!
//! peers ──► apply_payload() ──► remote entries ──► sweep_expired(now)
//! ```

use log::debug;
use quill_core::CursorPosition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::protocol::AwarenessPayload;

/// Identity shown next to a remote cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub display_name: String,
    /// CSS hex colour, e.g. `#61afef`
    pub color: String,
}

impl UserInfo {
    pub fn new(id: Uuid, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            color: color.into(),
        }
    }
}

/// Selection range, anchor first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

impl Selection {
    pub fn new(start: CursorPosition, end: CursorPosition) -> Self {
        Self { start, end }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// The state one client publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessFields {
    pub user: UserInfo,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
}

impl AwarenessFields {
    pub fn new(user: UserInfo) -> Self {
        Self {
            user,
            cursor: None,
            selection: None,
        }
    }
}

/// A remote client's last known state.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub fields: AwarenessFields,
    /// Sender wall clock of the winning update (ms since epoch)
    pub timestamp: u64,
    /// Local instant the entry was last refreshed
    pub last_seen_at: Instant,
}

/// Heartbeat and expiry timing.
#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// How often the local state is re-broadcast
    pub heartbeat_interval: Duration,
    /// Remote entries older than this are swept
    pub timeout: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(15);
        Self {
            heartbeat_interval,
            timeout: heartbeat_interval * 2,
        }
    }
}

impl AwarenessConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Local view of everyone's presence in one document.
pub struct AwarenessStore {
    local_id: Uuid,
    local: AwarenessFields,
    local_timestamp: u64,
    dirty: bool,
    remote: HashMap<Uuid, AwarenessEntry>,
    /// Leave timestamps of departed clients, kept until the next sweep past
    /// the timeout so that reordered older states stay dropped.
    departed: HashMap<Uuid, (u64, Instant)>,
    config: AwarenessConfig,
}

impl AwarenessStore {
    pub fn new(local_id: Uuid, local: AwarenessFields, config: AwarenessConfig) -> Self {
        Self {
            local_id,
            local,
            local_timestamp: now_millis(),
            dirty: true,
            remote: HashMap::new(),
            departed: HashMap::new(),
            config,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    pub fn local_fields(&self) -> &AwarenessFields {
        &self.local
    }

    /// Replace the local state and mark it for the next broadcast.
    pub fn set_local(&mut self, fields: AwarenessFields) {
        self.local = fields;
        self.touch_local();
    }

    /// Edit the local state in place and mark it for the next broadcast.
    pub fn update_local(&mut self, edit: impl FnOnce(&mut AwarenessFields)) {
        edit(&mut self.local);
        self.touch_local();
    }

    fn touch_local(&mut self) {
        // Strictly increasing even if the wall clock stalls or steps back.
        self.local_timestamp = now_millis().max(self.local_timestamp + 1);
        self.dirty = true;
    }

    /// The local state as a wire payload.
    pub fn local_state(&self) -> AwarenessPayload {
        AwarenessPayload::State {
            client_id: self.local_id,
            timestamp: self.local_timestamp,
            fields: self.local.clone(),
        }
    }

    /// The local state if it changed since the last call.
    pub fn take_dirty(&mut self) -> Option<AwarenessPayload> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.local_state())
    }

    /// Refresh the local timestamp and return the state for a heartbeat.
    pub fn heartbeat(&mut self) -> AwarenessPayload {
        self.touch_local();
        self.dirty = false;
        self.local_state()
    }

    /// Leave notice for the local client.
    pub fn leave_payload(&self) -> AwarenessPayload {
        AwarenessPayload::Leave {
            client_id: self.local_id,
            timestamp: now_millis().max(self.local_timestamp + 1),
        }
    }

    /// Last-writer-wins merge of a remote client's state.
    ///
    /// Returns `false` when the update was ignored: it came from the local
    /// client, is strictly older than what is stored, or is not newer than
    /// the client's leave.
    pub fn apply_remote(
        &mut self,
        client_id: Uuid,
        fields: AwarenessFields,
        timestamp: u64,
        now: Instant,
    ) -> bool {
        if client_id == self.local_id {
            return false;
        }
        if let Some(&(left_at, _)) = self.departed.get(&client_id) {
            if timestamp <= left_at {
                debug!(
                    "Ignoring awareness from departed {} ({} <= {})",
                    client_id, timestamp, left_at
                );
                return false;
            }
            self.departed.remove(&client_id);
        }
        if let Some(existing) = self.remote.get(&client_id) {
            if timestamp < existing.timestamp {
                debug!(
                    "Ignoring stale awareness from {} ({} < {})",
                    client_id, timestamp, existing.timestamp
                );
                return false;
            }
        }
        self.remote.insert(
            client_id,
            AwarenessEntry {
                client_id,
                fields,
                timestamp,
                last_seen_at: now,
            },
        );
        true
    }

    /// Apply a decoded wire payload. Returns whether anything changed.
    pub fn apply_payload(&mut self, payload: AwarenessPayload, now: Instant) -> bool {
        match payload {
            AwarenessPayload::State {
                client_id,
                timestamp,
                fields,
            } => self.apply_remote(client_id, fields, timestamp, now),
            AwarenessPayload::Leave {
                client_id,
                timestamp,
            } => self.apply_leave(client_id, timestamp, now),
        }
    }

    fn apply_leave(&mut self, client_id: Uuid, timestamp: u64, now: Instant) -> bool {
        if client_id == self.local_id {
            return false;
        }
        if self.remote.get(&client_id).is_some_and(|e| e.timestamp > timestamp) {
            return false;
        }
        let marker = self.departed.entry(client_id).or_insert((timestamp, now));
        if timestamp >= marker.0 {
            *marker = (timestamp, now);
        }
        self.remove(client_id)
    }

    /// Explicit leave.
    pub fn remove(&mut self, client_id: Uuid) -> bool {
        self.remote.remove(&client_id).is_some()
    }

    /// Drop remote entries not refreshed within the timeout.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.timeout;
        let expired: Vec<Uuid> = self
            .remote
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen_at) > timeout)
            .map(|e| e.client_id)
            .collect();

        for id in &expired {
            self.remote.remove(id);
            debug!("Awareness entry {} timed out", id);
        }
        self.departed
            .retain(|_, (_, left_at)| now.saturating_duration_since(*left_at) <= timeout);
        expired
    }

    /// Snapshot of remote entries, ordered by client id.
    pub fn list(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self.remote.values().cloned().collect();
        entries.sort_by_key(|e| e.client_id);
        entries
    }

    pub fn get(&self, client_id: &Uuid) -> Option<&AwarenessEntry> {
        self.remote.get(client_id)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Remote states as wire payloads, for replay to a newcomer.
    pub fn remote_payloads(&self) -> Vec<AwarenessPayload> {
        self.list()
            .into_iter()
            .map(|e| AwarenessPayload::State {
                client_id: e.client_id,
                timestamp: e.timestamp,
                fields: e.fields,
            })
            .collect()
    }
}
