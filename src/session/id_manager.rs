use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::now_ms;
use super::record::{IdEntry, IdState, SessionRecord};
use crate::error::{AppError, AppResult};
use crate::fabric::{session_map_name, ClusterFabric, DistMap, SESSION_CONTEXTS_MAP, SESSION_IDS_MAP};

const ID_ATTEMPTS: usize = 8;

/// Told about every session this node removes (invalidation or expiry).
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn session_invalidated(&self, record: &SessionRecord);
}

/// Cluster-wide session id coordination. One per node, shared by every context.
pub struct SessionIdManager {
    fabric: ClusterFabric,
    ids: DistMap<IdEntry>,
    contexts: DistMap<i64>,
    tombstone_ttl: Duration,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl SessionIdManager {
    pub fn new(fabric: &ClusterFabric, tombstone_ttl: Duration) -> Self {
        Self {
            fabric: fabric.clone(),
            ids: fabric.map(SESSION_IDS_MAP),
            contexts: fabric.map(SESSION_CONTEXTS_MAP),
            tombstone_ttl,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn fabric(&self) -> &ClusterFabric { &self.fabric }

    pub fn worker_suffix(&self) -> &str { self.fabric.worker_suffix() }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    /// Fresh id of the form `<randomness>.<worker>`, reserved cluster-wide.
    pub async fn new_id(&self) -> AppResult<String> {
        let entry = IdEntry { state: IdState::Reserved, worker: self.worker_suffix().to_string(), created_ms: now_ms() };
        for _ in 0..ID_ATTEMPTS {
            let id = format!("{}.{}", random_token()?, self.worker_suffix());
            // Unclaimed reservations lapse like tombstones do.
            if self.ids.put_if_absent_with_ttl(&id, &entry, self.tombstone_ttl).await?.is_none() {
                return Ok(id);
            }
            debug!(target: "sessions", id = %id, "session id collision, retrying");
        }
        Err(AppError::internal("could not reserve a unique session id"))
    }

    /// Reserved -> Active on first commit. False if the id was invalidated meanwhile.
    pub(crate) async fn activate(&self, id: &str) -> AppResult<bool> {
        let Some(cur) = self.ids.get(id).await? else {
            // Reservation lapsed; claim it again unless someone else did.
            let entry = IdEntry { state: IdState::Active, worker: self.worker_suffix().to_string(), created_ms: now_ms() };
            return Ok(self.ids.put_if_absent(id, &entry).await?.is_none());
        };
        match cur.state {
            IdState::Active => Ok(true),
            IdState::Invalidated => Ok(false),
            IdState::Reserved => {
                let active = IdEntry { state: IdState::Active, ..cur.clone() };
                if self.ids.replace_if_equal_with_ttl(id, &cur, &active, None).await? { return Ok(true); }
                Ok(matches!(self.ids.get(id).await?, Some(e) if e.state == IdState::Active))
            }
        }
    }

    /// True iff some node holds an open session record for `id`.
    pub async fn id_in_use(&self, id: &str) -> AppResult<bool> {
        Ok(matches!(self.ids.get(id).await?, Some(e) if e.state == IdState::Active))
    }

    pub async fn is_invalidated(&self, id: &str) -> AppResult<bool> {
        Ok(matches!(self.ids.get(id).await?, Some(e) if e.state == IdState::Invalidated))
    }

    /// Remove the session from every context in the cluster. Idempotent.
    pub async fn invalidate(&self, id: &str) -> AppResult<()> {
        self.tombstone(id).await?;
        for path in self.contexts.keys().await? {
            let map: DistMap<SessionRecord> = self.fabric.map(&session_map_name(&path));
            if let Some(rec) = map.remove(id).await? {
                info!(target: "sessions", session = %id, context = %path, "session invalidated");
                self.notify(&rec).await;
            }
        }
        Ok(())
    }

    /// Record an expiry observed by a per-context manager.
    pub(crate) async fn retire(&self, rec: &SessionRecord) -> AppResult<()> {
        self.tombstone(&rec.id).await?;
        self.notify(rec).await;
        Ok(())
    }

    pub(crate) async fn register_context(&self, context_path: &str) -> AppResult<()> {
        self.contexts.put_if_absent(context_path, &now_ms()).await?;
        Ok(())
    }

    pub(crate) async fn evict_expired(&self) -> AppResult<usize> { self.ids.evict_expired().await }

    async fn tombstone(&self, id: &str) -> AppResult<()> {
        let entry = IdEntry { state: IdState::Invalidated, worker: self.worker_suffix().to_string(), created_ms: now_ms() };
        self.ids.put_with_ttl(id, &entry, self.tombstone_ttl).await
    }

    async fn notify(&self, rec: &SessionRecord) {
        let listeners: Vec<Arc<dyn SessionListener>> = self.listeners.read().clone();
        for l in listeners { l.session_invalidated(rec).await; }
    }
}

/// Worker suffix embedded in a session id, if any.
pub fn worker_of(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(_, w)| w).filter(|w| !w.is_empty())
}

/// 128-bit random token, base64url without padding.
pub(crate) fn random_token() -> AppResult<String> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf).map_err(|e| AppError::internal(format!("randomness unavailable: {}", e)))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}
