use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::id_manager::{worker_of, SessionIdManager};
use super::now_ms;
use super::record::{Session, SessionRecord};
use crate::error::{AppError, AppResult};
use crate::fabric::{session_map_name, DistMap, MapEventKind};

const FLUSH_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Default for new sessions; `Duration::ZERO` disables expiry.
    pub max_inactive: Duration,
    pub scavenge_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { max_inactive: Duration::from_secs(30 * 60), scavenge_interval: Duration::from_secs(60) }
    }
}

/// What `complete` did with the request's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New and never written to; nothing stored.
    Discarded,
    Created,
    Updated,
    /// A newer concurrent write won.
    LostConflict,
    /// Invalidated or expired by someone else; not resurrected.
    Gone,
    Invalidated,
}

/// Per-context session manager backed by `sessions.<context-path>`.
pub struct SessionManager {
    context_path: String,
    ids: Arc<SessionIdManager>,
    map: DistMap<SessionRecord>,
    settings: SessionSettings,
    /// This node's shard: sessions it created or served.
    resident: RwLock<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(context_path: &str, ids: Arc<SessionIdManager>, settings: SessionSettings) -> Self {
        let map = ids.fabric().map(&session_map_name(context_path));
        let (shutdown, _) = watch::channel(false);
        Self {
            context_path: context_path.to_string(),
            ids,
            map,
            settings,
            resident: RwLock::new(HashSet::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context_path(&self) -> &str { &self.context_path }

    pub fn id_manager(&self) -> &Arc<SessionIdManager> { &self.ids }

    pub fn resident_sessions(&self) -> Vec<String> {
        let mut v: Vec<String> = self.resident.read().iter().cloned().collect();
        v.sort();
        v
    }

    /// Latest committed snapshot for `id`. Uncommitted mutations on other nodes are not visible.
    pub async fn get_session(&self, id: &str) -> AppResult<Option<Session>> {
        if self.ids.is_invalidated(id).await? { return Ok(None); }
        match self.map.get_versioned(id).await? {
            Some(v) => {
                self.resident.write().insert(id.to_string());
                Ok(Some(Session::from_record(v.value, v.version)))
            }
            None => Ok(None),
        }
    }

    /// A fresh session. Nothing is stored until it is written to and completed.
    pub async fn new_session(&self) -> AppResult<Session> {
        let id = self.ids.new_id().await?;
        let max = self.settings.max_inactive.as_millis() as i64;
        debug!(target: "sessions", context = %self.context_path, session = %id, "new session");
        Ok(Session::fresh(id, now_ms(), max))
    }

    /// Cooperative expiry. Returns false (and removes the record) if the
    /// session sat idle longer than its max inactive interval.
    pub async fn access(&self, session: &mut Session, now_ms: i64) -> AppResult<bool> {
        if session.is_new {
            session.last_accessed_ms = now_ms;
            return Ok(true);
        }
        let snapshot = session.to_record(0, "");
        if !snapshot.is_expired(now_ms) {
            session.last_accessed_ms = now_ms;
            return Ok(true);
        }
        if let Some(version) = session.base_version {
            if self.map.remove_if_version(&session.id, version).await? {
                info!(target: "sessions", context = %self.context_path, session = %session.id, "session expired");
                self.resident.write().remove(&session.id);
                self.ids.retire(&snapshot).await?;
                return Ok(false);
            }
        }
        // Someone touched it after our read; judge the fresher snapshot.
        match self.map.get_versioned(&session.id).await? {
            Some(v) if !v.value.is_expired(now_ms) => {
                *session = Session::from_record(v.value, v.version);
                session.last_accessed_ms = now_ms;
                Ok(true)
            }
            Some(v) => {
                if self.map.remove_if_version(&session.id, v.version).await? {
                    self.resident.write().remove(&session.id);
                    self.ids.retire(&v.value).await?;
                }
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Invalidate now, cluster-wide.
    pub async fn invalidate(&self, session: &mut Session) -> AppResult<()> {
        session.invalidated = true;
        self.resident.write().remove(&session.id);
        self.ids.invalidate(&session.id).await
    }

    /// Flush the request's buffered mutations.
    pub async fn complete(&self, mut session: Session) -> AppResult<CommitOutcome> {
        if session.invalidated {
            self.invalidate(&mut session).await?;
            return Ok(CommitOutcome::Invalidated);
        }
        let writer = self.ids.worker_suffix().to_string();
        if session.is_new {
            if !session.dirty && session.attributes.is_empty() { return Ok(CommitOutcome::Discarded); }
            if !self.ids.activate(&session.id).await? { return Ok(CommitOutcome::Gone); }
            self.ids.register_context(&self.context_path).await?;
            let rec = session.to_record(now_ms(), &writer);
            if self.map.put_if_absent(&session.id, &rec).await?.is_none() {
                self.resident.write().insert(session.id.clone());
                return Ok(CommitOutcome::Created);
            }
            return self.resolve_conflict(rec).await;
        }
        let Some(version) = session.base_version else { return Ok(CommitOutcome::Gone); };
        let rec = session.to_record(now_ms(), &writer);
        if self.map.replace_if_version(&session.id, version, &rec).await?.is_some() {
            return Ok(CommitOutcome::Updated);
        }
        if !session.dirty {
            // Access-only flush; never let a stale attribute set win.
            return Ok(if self.map.get(&session.id).await?.is_some() { CommitOutcome::LostConflict } else { CommitOutcome::Gone });
        }
        self.resolve_conflict(rec).await
    }

    async fn resolve_conflict(&self, rec: SessionRecord) -> AppResult<CommitOutcome> {
        for _ in 0..FLUSH_ATTEMPTS {
            let Some(cur) = self.map.get_versioned(&rec.id).await? else { return Ok(CommitOutcome::Gone); };
            if !rec.newer_than(&cur.value) {
                debug!(target: "sessions", error = %AppError::SessionConflict(rec.id.clone()), winner = %cur.value.writer, "concurrent write won");
                return Ok(CommitOutcome::LostConflict);
            }
            if self.map.replace_if_version(&rec.id, cur.version, &rec).await?.is_some() {
                debug!(target: "sessions", error = %AppError::SessionConflict(rec.id.clone()), loser = %cur.value.writer, "overwrote concurrent write");
                return Ok(CommitOutcome::Updated);
            }
        }
        Ok(CommitOutcome::LostConflict)
    }

    /// One scavenger pass over this node's shard. Returns the number of sessions removed.
    pub async fn scavenge(&self, now_ms: i64) -> AppResult<usize> {
        // Full-scan reconciliation: adopt records this worker wrote but lost
        // track of, and records whose writer is no longer a member.
        let suffix = self.ids.worker_suffix().to_string();
        let live: HashSet<String> = self.ids.fabric().members().await?.into_iter().map(|m| m.worker_suffix).collect();
        for key in self.map.keys().await? {
            let adopt = match worker_of(&key) {
                Some(w) => w == suffix || !live.contains(w),
                None => true,
            };
            if adopt && self.resident.write().insert(key.clone()) && worker_of(&key) != Some(suffix.as_str()) {
                debug!(target: "sessions", context = %self.context_path, session = %key, "adopted session of departed member");
            }
        }
        let mut removed = 0usize;
        for id in self.resident_sessions() {
            match self.map.get_versioned(&id).await? {
                None => { self.resident.write().remove(&id); }
                Some(v) if v.value.is_expired(now_ms) => {
                    if self.map.remove_if_version(&id, v.version).await? {
                        self.ids.retire(&v.value).await?;
                        removed += 1;
                    }
                    self.resident.write().remove(&id);
                }
                Some(_) => {}
            }
        }
        self.map.evict_expired().await?;
        self.ids.evict_expired().await?;
        if removed > 0 { info!(target: "sessions", context = %self.context_path, removed = removed, "scavenged sessions"); }
        Ok(removed)
    }

    /// Start the scavenger and the eviction listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() { return; }

        let this = self.clone();
        let mut stop = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.scavenge_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.scavenge(now_ms()).await {
                            warn!(target: "sessions", context = %this.context_path, "scavenger pass failed: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let this = self.clone();
        let mut stop = self.shutdown.subscribe();
        let mut events = self.map.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = events.recv() => match ev {
                        Some(ev) if matches!(ev.kind, MapEventKind::Removed | MapEventKind::Expired) => {
                            this.resident.write().remove(&ev.key);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));
    }

    /// Stop background tasks. Session data stays in the fabric.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for t in tasks { let _ = t.await; }
    }
}
