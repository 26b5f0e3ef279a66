use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::artifact::ArtifactFetcher;
use super::context::ContextFactory;
use super::descriptor::AppDescriptor;
use super::manager::{DeploymentManager, LiveContext};
use super::view::{ViewClient, ViewPoll};
use crate::error::{AppError, AppResult};
use crate::identity::AuthenticatorFactory;
use crate::session::SessionManagerProvider;

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub poll_interval: Duration,
    pub drain_grace: Duration,
    /// Start failures on one revision before it is left alone.
    pub max_start_failures: u32,
    pub workers: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(5), drain_grace: Duration::from_secs(30), max_start_failures: 5, workers: 4 }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// False when the view reported no change.
    pub changed: bool,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// `(app-id, reason)`; retried on the next poll unless suppressed.
    pub failed: Vec<(String, String)>,
    pub suppressed: Vec<String>,
    /// Rows older than the live revision; left alone.
    pub stale: Vec<String>,
}

enum Transition {
    Add(AppDescriptor),
    Update(AppDescriptor),
    Remove(String),
}

enum Outcome {
    Deployed { app: AppDescriptor, replaced: bool },
    Removed(String),
    Failed { app_id: String, revision: Option<String>, error: AppError },
}

#[derive(Default)]
struct ProviderState {
    seq: Option<String>,
    /// Descriptors of the live contexts, keyed by app id.
    known: HashMap<String, AppDescriptor>,
    /// app id -> (revision, consecutive start failures)
    failures: HashMap<String, (String, u32)>,
}

struct Workers {
    fetcher: Arc<ArtifactFetcher>,
    factory: Arc<dyn ContextFactory>,
    deployments: Arc<DeploymentManager>,
    sessions: Arc<dyn SessionManagerProvider>,
    auth: AuthenticatorFactory,
    drain_grace: Duration,
    retiring: Mutex<JoinSet<()>>,
}

/// Keeps the live contexts in step with the deployments view.
pub struct AppProvider {
    view: ViewClient,
    workers: Arc<Workers>,
    settings: ProviderSettings,
    permits: Arc<Semaphore>,
    state: Mutex<ProviderState>,
    shutdown: watch::Sender<bool>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AppProvider {
    pub fn new(
        view: ViewClient,
        fetcher: Arc<ArtifactFetcher>,
        factory: Arc<dyn ContextFactory>,
        deployments: Arc<DeploymentManager>,
        sessions: Arc<dyn SessionManagerProvider>,
        auth: AuthenticatorFactory,
        settings: ProviderSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let workers = Arc::new(Workers { fetcher, factory, deployments, sessions, auth, drain_grace: settings.drain_grace, retiring: Mutex::new(JoinSet::new()) });
        Self {
            view,
            workers,
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            state: Mutex::new(ProviderState::default()),
            shutdown,
            poller: parking_lot::Mutex::new(None),
        }
    }

    pub fn deployments(&self) -> &Arc<DeploymentManager> { &self.workers.deployments }

    pub async fn last_seq(&self) -> Option<String> { self.state.lock().await.seq.clone() }

    /// Retirements started but not yet collected by a poll.
    pub async fn retiring(&self) -> usize { self.workers.retiring.lock().await.len() }

    /// One reconciliation pass. A view error skips the pass and changes nothing.
    pub async fn poll_once(&self) -> AppResult<PollReport> {
        self.workers.reap_retired().await;
        let mut state = self.state.lock().await;
        let snapshot = match self.view.poll(state.seq.as_deref()).await? {
            ViewPoll::Unchanged => return Ok(PollReport::default()),
            ViewPoll::Changed(s) => s,
        };
        let mut report = PollReport { changed: true, ..Default::default() };

        let mut wanted: HashMap<String, AppDescriptor> = HashMap::new();
        for app in snapshot.apps {
            if wanted.contains_key(&app.app_id) {
                warn!(target: "deploy", app_id = %app.app_id, doc = %app.doc_id, "duplicate app id in deployments view; keeping the first row");
                continue;
            }
            wanted.insert(app.app_id.clone(), app);
        }
        let unreadable: HashSet<String> = snapshot.rejected.into_iter().collect();

        let mut plan = Vec::new();
        for (id, app) in &wanted {
            if let Some((rev, n)) = state.failures.get(id) {
                if rev == app.revision.as_str() && *n >= self.settings.max_start_failures {
                    report.suppressed.push(id.clone());
                    continue;
                }
            }
            match state.known.get(id) {
                None => plan.push(Transition::Add(app.clone())),
                Some(live) if live.revision == app.revision => {}
                Some(live) if app.revision.is_older_than(&live.revision) => {
                    warn!(target: "deploy", app_id = %id, live = %live.revision, row = %app.revision, "deployments view is behind the live revision; not downgrading");
                    report.stale.push(id.clone());
                }
                Some(_) => plan.push(Transition::Update(app.clone())),
            }
        }
        for (id, live) in &state.known {
            // An unreadable row is not a removal.
            if !wanted.contains_key(id) && !unreadable.contains(&live.doc_id) {
                plan.push(Transition::Remove(id.clone()));
            }
        }
        state.failures.retain(|id, (rev, _)| wanted.get(id).map(|a| a.revision.as_str() == rev.as_str()).unwrap_or(false));

        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        for t in plan {
            let workers = self.workers.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                workers.run(t).await
            });
        }

        let mut retry = false;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(o) => o,
                Err(e) => {
                    error!(target: "deploy", "deployment task failed: {}", e);
                    retry = true;
                    continue;
                }
            };
            match outcome {
                Outcome::Deployed { app, replaced } => {
                    state.failures.remove(&app.app_id);
                    if replaced { report.updated.push(app.app_id.clone()); } else { report.added.push(app.app_id.clone()); }
                    state.known.insert(app.app_id.clone(), app);
                }
                Outcome::Removed(id) => {
                    state.known.remove(&id);
                    report.removed.push(id);
                }
                Outcome::Failed { app_id, revision, error } => {
                    error!(target: "deploy", app_id = %app_id, "{}", error);
                    let mut suppressed = false;
                    if let (AppError::ContextStartFailed { .. }, Some(rev)) = (&error, revision) {
                        let entry = state.failures.entry(app_id.clone()).or_insert_with(|| (rev.clone(), 0));
                        if entry.0 != rev { *entry = (rev, 0); }
                        entry.1 += 1;
                        if entry.1 >= self.settings.max_start_failures {
                            warn!(target: "deploy", app_id = %app_id, revision = %entry.0, failures = entry.1, "giving up on this revision until it changes");
                            suppressed = true;
                        }
                    }
                    if suppressed { report.suppressed.push(app_id.clone()); } else { retry = true; }
                    report.failed.push((app_id, error.to_string()));
                }
            }
        }

        if !retry { state.seq = Some(snapshot.seq); }
        for v in [&mut report.added, &mut report.updated, &mut report.removed, &mut report.suppressed, &mut report.stale] { v.sort(); }
        report.failed.sort();
        Ok(report)
    }

    /// Start the poller task.
    pub fn spawn(self: &Arc<Self>) {
        let mut slot = self.poller.lock();
        if slot.is_some() { return; }
        let this = self.clone();
        let mut stop = self.shutdown.subscribe();
        *slot = Some(tokio::spawn(async move {
            info!(target: "deploy", view = %this.view.view_url(), interval_ms = this.settings.poll_interval.as_millis() as u64, "app provider polling");
            loop {
                match this.poll_once().await {
                    Ok(r) if r.changed => info!(target: "deploy", added = r.added.len(), updated = r.updated.len(), removed = r.removed.len(), failed = r.failed.len(), "deployments reconciled"),
                    Ok(_) => {}
                    Err(e) => warn!(target: "deploy", "poll skipped: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(this.settings.poll_interval) => {}
                    _ = stop.changed() => break,
                }
            }
        }));
    }

    /// Stop polling, finish retirements in progress, then drain and stop every context.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let poller = self.poller.lock().take();
        if let Some(p) = poller { let _ = p.await; }
        // Any pass still running holds the state lock.
        drop(self.state.lock().await);
        let mut retiring = self.workers.retiring.lock().await;
        while retiring.join_next().await.is_some() {}
        self.workers.deployments.drain_all(self.settings.drain_grace).await;
        self.state.lock().await.known.clear();
    }
}

impl Workers {
    async fn run(self: Arc<Self>, t: Transition) -> Outcome {
        match t {
            Transition::Add(app) | Transition::Update(app) => {
                let (app_id, rev) = (app.app_id.clone(), app.revision.to_string());
                match self.deploy(app).await {
                    Ok(o) => o,
                    Err(error) => Outcome::Failed { app_id, revision: Some(rev), error },
                }
            }
            Transition::Remove(app_id) => {
                if let Some(old) = self.deployments.remove(&app_id) { self.retire(old).await; }
                Outcome::Removed(app_id)
            }
        }
    }

    async fn deploy(&self, app: AppDescriptor) -> AppResult<Outcome> {
        let artifact = self.fetcher.fetch(&app).await?;
        let handler = match self.factory.create(&app, &artifact).await {
            Ok(h) => h,
            Err(e) => {
                self.discard_unless_live(&artifact).await;
                return Err(AppError::start(&app.app_id, format!("{:#}", e)));
            }
        };
        if let Err(e) = handler.start().await {
            handler.stop().await;
            self.discard_unless_live(&artifact).await;
            return Err(AppError::start(&app.app_id, format!("{:#}", e)));
        }
        let sessions = self.sessions.provide(&app.context_path);
        let authenticator = self.auth.build(&app);
        let ctx = Arc::new(LiveContext::new(app.clone(), handler.clone(), sessions, authenticator, artifact.clone()));
        match self.deployments.swap(ctx) {
            Ok(old) => {
                let replaced = old.is_some();
                if let Some(old) = old { self.retire(old).await; }
                Ok(Outcome::Deployed { app, replaced })
            }
            Err(e) => {
                handler.stop().await;
                self.discard_unless_live(&artifact).await;
                Err(e)
            }
        }
    }

    /// Drain, stop and delete the old context's artifact in the background.
    /// A context path nothing serves any more also loses its session manager.
    async fn retire(&self, old: Arc<LiveContext>) {
        let grace = self.drain_grace;
        let deployments = self.deployments.clone();
        let fetcher = self.fetcher.clone();
        let sessions = self.sessions.clone();
        self.retiring.lock().await.spawn(async move {
            if !old.drain(grace).await {
                warn!(target: "deploy", app_id = %old.app_id(), in_flight = old.in_flight(), "drain grace period expired");
            }
            old.handler.stop().await;
            let live = deployments.contexts();
            if !live.iter().any(|c| c.artifact == old.artifact) {
                fetcher.discard(&old.artifact).await;
            }
            if !live.iter().any(|c| c.context_path() == old.context_path()) {
                if let Some(m) = sessions.release(old.context_path()) {
                    m.stop().await;
                    debug!(target: "deploy", context_path = %old.context_path(), "session manager stopped");
                }
            }
            info!(target: "deploy", app_id = %old.app_id(), revision = %old.app.revision, "context retired");
        });
    }

    /// Collect retirements that already finished.
    async fn reap_retired(&self) {
        let mut retiring = self.retiring.lock().await;
        while let Some(done) = retiring.try_join_next() {
            if let Err(e) = done { error!(target: "deploy", "context retirement failed: {}", e); }
        }
    }

    async fn discard_unless_live(&self, artifact: &PathBuf) {
        if !self.deployments.contexts().iter().any(|c| &c.artifact == artifact) {
            self.fetcher.discard(artifact).await;
        }
    }
}
