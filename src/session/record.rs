use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session attribute holding the auth token of the principal bound to the session.
pub const AUTH_TOKEN_ATTRIBUTE: &str = "camelback.auth_token";

/// Committed session snapshot as stored in `sessions.<context-path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_ms: i64,
    pub last_accessed_ms: i64,
    /// Zero or negative: never expires.
    pub max_inactive_ms: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Wall-clock epoch of the flush that produced this snapshot.
    pub written_ms: i64,
    /// Worker suffix of the node that flushed it.
    pub writer: String,
}

impl SessionRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.max_inactive_ms > 0 && now_ms - self.last_accessed_ms > self.max_inactive_ms
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.attributes.get(AUTH_TOKEN_ATTRIBUTE).and_then(|v| v.as_str())
    }

    /// Last-writer-wins ordering: wall-clock epoch, ties broken by worker suffix.
    pub(crate) fn newer_than(&self, other: &SessionRecord) -> bool {
        (self.written_ms, self.writer.as_str()) > (other.written_ms, other.writer.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdState {
    /// Issued, no record committed yet.
    Reserved,
    Active,
    /// Tombstone; the id is never reissued while it lives.
    Invalidated,
}

/// Value stored in `sessions.ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdEntry {
    pub state: IdState,
    pub worker: String,
    pub created_ms: i64,
}

/// Request-confined view of a session. Mutations stay local until
/// `SessionManager::complete` flushes them.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) id: String,
    pub(crate) is_new: bool,
    pub(crate) base_version: Option<u64>,
    pub(crate) created_ms: i64,
    pub(crate) last_accessed_ms: i64,
    pub(crate) max_inactive_ms: i64,
    pub(crate) attributes: BTreeMap<String, Value>,
    pub(crate) dirty: bool,
    pub(crate) invalidated: bool,
}

impl Session {
    pub(crate) fn fresh(id: String, now_ms: i64, max_inactive_ms: i64) -> Self {
        Self {
            id,
            is_new: true,
            base_version: None,
            created_ms: now_ms,
            last_accessed_ms: now_ms,
            max_inactive_ms,
            attributes: BTreeMap::new(),
            dirty: false,
            invalidated: false,
        }
    }

    pub(crate) fn from_record(rec: SessionRecord, version: u64) -> Self {
        Self {
            id: rec.id,
            is_new: false,
            base_version: Some(version),
            created_ms: rec.created_ms,
            last_accessed_ms: rec.last_accessed_ms,
            max_inactive_ms: rec.max_inactive_ms,
            attributes: rec.attributes,
            dirty: false,
            invalidated: false,
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn is_new(&self) -> bool { self.is_new }
    pub fn created_ms(&self) -> i64 { self.created_ms }
    pub fn last_accessed_ms(&self) -> i64 { self.last_accessed_ms }
    pub fn is_invalidated(&self) -> bool { self.invalidated }

    pub fn max_inactive_interval(&self) -> Option<Duration> {
        if self.max_inactive_ms > 0 { Some(Duration::from_millis(self.max_inactive_ms as u64)) } else { None }
    }

    /// `Duration::ZERO` makes the session non-expiring.
    pub fn set_max_inactive_interval(&mut self, interval: Duration) {
        self.max_inactive_ms = interval.as_millis() as i64;
        self.dirty = true;
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> { self.attributes.get(name) }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
        self.dirty = true;
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        let out = self.attributes.remove(name);
        if out.is_some() { self.dirty = true; }
        out
    }

    pub fn attribute_names(&self) -> Vec<String> { self.attributes.keys().cloned().collect() }

    pub fn attributes(&self) -> &BTreeMap<String, Value> { &self.attributes }

    /// Mark for invalidation; applied cluster-wide when the request completes.
    pub fn invalidate(&mut self) { self.invalidated = true; }

    pub(crate) fn to_record(&self, written_ms: i64, writer: &str) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            created_ms: self.created_ms,
            last_accessed_ms: self.last_accessed_ms,
            max_inactive_ms: self.max_inactive_ms,
            attributes: self.attributes.clone(),
            written_ms,
            writer: writer.to_string(),
        }
    }
}
