//! Clustered HTTP sessions.
//! One `SessionIdManager` per node issues and retires ids cluster-wide; each
//! context gets its own `SessionManager` over `sessions.<context-path>`.
//! Requests work on a local `Session` copy that is flushed on `complete`.

mod id_manager;
mod manager;
mod record;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub use id_manager::{worker_of, SessionIdManager, SessionListener};
pub use manager::{CommitOutcome, SessionManager, SessionSettings};
pub use record::{IdEntry, IdState, Session, SessionRecord, AUTH_TOKEN_ATTRIBUTE};

pub(crate) use id_manager::random_token;

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

/// Hands a session manager to each context as it is installed.
pub trait SessionManagerProvider: Send + Sync {
    fn provide(&self, context_path: &str) -> Arc<SessionManager>;

    /// Forget the manager of a context path no live context serves any more.
    /// The caller stops it.
    fn release(&self, context_path: &str) -> Option<Arc<SessionManager>>;
}

/// Shares one id manager across every context on the node and keeps one
/// started `SessionManager` per context path.
pub struct ClusterSessionProvider {
    ids: Arc<SessionIdManager>,
    settings: SessionSettings,
    managers: Mutex<HashMap<String, Arc<SessionManager>>>,
}

impl ClusterSessionProvider {
    pub fn new(ids: Arc<SessionIdManager>, settings: SessionSettings) -> Self {
        Self { ids, settings, managers: Mutex::new(HashMap::new()) }
    }

    pub fn id_manager(&self) -> &Arc<SessionIdManager> { &self.ids }

    pub fn managers(&self) -> Vec<Arc<SessionManager>> { self.managers.lock().values().cloned().collect() }

    /// Stop every manager's background tasks.
    pub async fn stop_all(&self) {
        let all = self.managers();
        for m in all { m.stop().await; }
    }
}

impl SessionManagerProvider for ClusterSessionProvider {
    fn provide(&self, context_path: &str) -> Arc<SessionManager> {
        let mut managers = self.managers.lock();
        if let Some(m) = managers.get(context_path) { return m.clone(); }
        let m = Arc::new(SessionManager::new(context_path, self.ids.clone(), self.settings.clone()));
        m.start();
        managers.insert(context_path.to_string(), m.clone());
        m
    }

    fn release(&self, context_path: &str) -> Option<Arc<SessionManager>> {
        self.managers.lock().remove(context_path)
    }
}
