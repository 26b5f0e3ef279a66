use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::context::WebApp;
use super::descriptor::AppDescriptor;
use crate::error::{AppError, AppResult};
use crate::identity::SsoAuthenticator;
use crate::session::SessionManager;

/// An installed context. The app, its session manager and its authenticator
/// are fixed for the context's lifetime; a redeploy installs a new one.
pub struct LiveContext {
    pub app: AppDescriptor,
    pub handler: Arc<dyn WebApp>,
    pub sessions: Arc<SessionManager>,
    pub authenticator: Arc<SsoAuthenticator>,
    pub artifact: PathBuf,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl LiveContext {
    pub fn new(app: AppDescriptor, handler: Arc<dyn WebApp>, sessions: Arc<SessionManager>, authenticator: Arc<SsoAuthenticator>, artifact: PathBuf) -> Self {
        Self { app, handler, sessions, authenticator, artifact, in_flight: AtomicUsize::new(0), idle: Notify::new() }
    }

    pub fn app_id(&self) -> &str { &self.app.app_id }

    pub fn context_path(&self) -> &str { &self.app.context_path }

    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::SeqCst) }

    /// Count a dispatched request until the guard drops.
    pub fn enter(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard { ctx: self.clone() }
    }

    /// Wait for in-flight requests to finish. False if the grace period ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 { break; }
                notified.await;
            }
        })
        .await;
        drained.is_ok()
    }

    fn serves(&self, host: Option<&str>) -> bool {
        if self.app.hosts.is_empty() { return true; }
        match host {
            Some(h) => self.app.hosts.contains(h),
            None => false,
        }
    }

    /// `/wiki` serves `/wiki` and `/wiki/..`, not `/wikis`. Returns the path below the context.
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        let cp = self.context_path();
        if cp == "/" { return Some(path); }
        let rest = path.strip_prefix(cp)?;
        if rest.is_empty() || rest.starts_with('/') { Some(rest) } else { None }
    }

    fn conflicts_with(&self, other: &AppDescriptor) -> bool {
        if self.app.context_path != other.context_path { return false; }
        let (a, b) = (&self.app.hosts, &other.hosts);
        (a.is_empty() && b.is_empty()) || a.intersection(b).next().is_some()
    }
}

pub struct RequestGuard {
    ctx: Arc<LiveContext>,
}

impl RequestGuard {
    pub fn context(&self) -> &Arc<LiveContext> { &self.ctx }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.ctx.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ctx.idle.notify_waiters();
        }
    }
}

fn host_only(host: &str) -> String {
    let h = host.trim();
    let h = if h.starts_with('[') { h.split(']').next().map(|s| &s[1..]).unwrap_or(h) } else { h.split(':').next().unwrap_or(h) };
    h.to_ascii_lowercase()
}

/// The live context table. Readers take a snapshot; writers replace it whole.
#[derive(Default)]
pub struct DeploymentManager {
    contexts: RwLock<Arc<Vec<Arc<LiveContext>>>>,
}

impl DeploymentManager {
    pub fn new() -> Self { Self::default() }

    pub fn contexts(&self) -> Arc<Vec<Arc<LiveContext>>> { self.contexts.read().clone() }

    pub fn get(&self, app_id: &str) -> Option<Arc<LiveContext>> {
        self.contexts().iter().find(|c| c.app_id() == app_id).cloned()
    }

    /// Sorted `(context-path, hosts)` pairs currently served.
    pub fn served(&self) -> Vec<(String, BTreeSet<String>)> {
        let mut v: Vec<(String, BTreeSet<String>)> = self.contexts().iter().map(|c| (c.app.context_path.clone(), c.app.hosts.clone())).collect();
        v.sort();
        v
    }

    fn check(list: &[Arc<LiveContext>], ctx: &LiveContext, replacing: Option<&str>) -> AppResult<()> {
        for c in list.iter().filter(|c| Some(c.app_id()) != replacing) {
            if c.app_id() == ctx.app_id() {
                return Err(AppError::start(ctx.app_id(), "already installed"));
            }
            if c.conflicts_with(&ctx.app) {
                return Err(AppError::start(ctx.app_id(), format!("context path {} already served by {}", ctx.context_path(), c.app_id())));
            }
        }
        Ok(())
    }

    pub fn install(&self, ctx: Arc<LiveContext>) -> AppResult<()> {
        let mut w = self.contexts.write();
        Self::check(&w, &ctx, None)?;
        let mut next: Vec<Arc<LiveContext>> = w.as_ref().clone();
        info!(target: "deploy", app_id = %ctx.app_id(), path = %ctx.context_path(), revision = %ctx.app.revision, "context installed");
        next.push(ctx);
        *w = Arc::new(next);
        Ok(())
    }

    /// Put `ctx` in place of the context with the same app id. New requests see
    /// `ctx` as soon as this returns; the old context is handed back for draining.
    pub fn swap(&self, ctx: Arc<LiveContext>) -> AppResult<Option<Arc<LiveContext>>> {
        let mut w = self.contexts.write();
        Self::check(&w, &ctx, Some(ctx.app_id()))?;
        let mut next: Vec<Arc<LiveContext>> = Vec::with_capacity(w.len() + 1);
        let mut old = None;
        for c in w.iter() {
            if c.app_id() == ctx.app_id() { old = Some(c.clone()); } else { next.push(c.clone()); }
        }
        info!(target: "deploy", app_id = %ctx.app_id(), path = %ctx.context_path(), revision = %ctx.app.revision, replaced = old.is_some(), "context swapped");
        next.push(ctx);
        *w = Arc::new(next);
        Ok(old)
    }

    pub fn remove(&self, app_id: &str) -> Option<Arc<LiveContext>> {
        let mut w = self.contexts.write();
        let old = w.iter().find(|c| c.app_id() == app_id).cloned()?;
        let next: Vec<Arc<LiveContext>> = w.iter().filter(|c| c.app_id() != app_id).cloned().collect();
        *w = Arc::new(next);
        info!(target: "deploy", app_id = %app_id, "context removed");
        Some(old)
    }

    /// Longest matching context path wins; a context bound to the host beats
    /// a host-agnostic one at the same path.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<(Arc<LiveContext>, String)> {
        let host = host.map(host_only);
        let snapshot = self.contexts();
        let mut best: Option<(&Arc<LiveContext>, &str)> = None;
        for c in snapshot.iter() {
            if !c.serves(host.as_deref()) { continue; }
            let Some(rest) = c.strip(path) else { continue; };
            let better = match best {
                None => true,
                Some((b, _)) => {
                    let (cl, bl) = (c.context_path().len(), b.context_path().len());
                    cl > bl || (cl == bl && !c.app.hosts.is_empty() && b.app.hosts.is_empty())
                }
            };
            if better { best = Some((c, rest)); }
        }
        best.map(|(c, rest)| (c.clone(), if rest.is_empty() { "/".to_string() } else { rest.to_string() }))
    }

    /// Remove and drain everything; used at shutdown.
    pub async fn drain_all(&self, grace: Duration) {
        let all = {
            let mut w = self.contexts.write();
            std::mem::replace(&mut *w, Arc::new(Vec::new()))
        };
        for c in all.iter() {
            if !c.drain(grace).await {
                warn!(target: "deploy", app_id = %c.app_id(), in_flight = c.in_flight(), "drain grace period expired");
            }
            c.handler.stop().await;
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
