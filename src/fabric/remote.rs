use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::grid::{FabricConfig, MemberInfo};
use super::map::{EventSource, MapListener};
use super::wire::{CounterReply, CounterRequest, EventsReply, EventsRequest, JoinReply, JoinRequest, MapOp, MapReply, MapRequest, OpResult, CLUSTER_HEADER};
use crate::error::{AppError, AppResult};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MIN_ATTEMPT: Duration = Duration::from_millis(50);
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 256;

fn seed_url(seed: &str) -> String {
    let seed = seed.trim().trim_end_matches('/');
    if seed.contains("://") { seed.to_string() } else { format!("http://{}", seed) }
}

/// HTTP client for a grid hosted by another process.
pub(crate) struct RemoteGrid {
    base: String,
    cluster: String,
    client: reqwest::Client,
    op_timeout: Duration,
    /// Highest notification sequence seen in any reply; new listeners start here.
    seq: AtomicU64,
    reachable: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteGrid {
    /// Try each seed in order and join the first that answers.
    pub(crate) async fn join(config: &FabricConfig, name: &str) -> AppResult<(Arc<Self>, MemberInfo)> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.operation_timeout())
            .build()
            .map_err(|e| AppError::config(format!("fabric client: {}", e)))?;
        let mut failures = Vec::new();
        for seed in &config.members {
            let grid = Arc::new(Self {
                base: seed_url(seed),
                cluster: config.cluster_name.clone(),
                client: client.clone(),
                op_timeout: config.operation_timeout(),
                seq: AtomicU64::new(0),
                reachable: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
            });
            match grid.post::<_, JoinReply>("members", &JoinRequest { name: name.to_string() }).await {
                Ok(reply) => {
                    grid.observe(reply.seq);
                    grid.start_heartbeat(reply.member.uuid, config.heartbeat_interval());
                    info!(target: "fabric", host = %grid.base, member = %reply.member.name, worker = %reply.member.worker_suffix, "joined remote grid");
                    return Ok((grid, reply.member));
                }
                Err(e) => {
                    warn!(target: "fabric", seed = %grid.base, error = %e, "fabric seed did not accept the join");
                    failures.push(format!("{}: {}", grid.base, e));
                }
            }
        }
        if failures.is_empty() { return Err(AppError::config("hazelcastConfig lists no members to join")); }
        Err(AppError::fabric(format!("no fabric member reachable ({})", failures.join("; "))))
    }

    pub(crate) fn is_reachable(&self) -> bool { self.reachable.load(Ordering::SeqCst) }

    fn observe(&self, seq: u64) { self.seq.fetch_max(seq, Ordering::SeqCst); }

    /// Send one request, retrying refused connections and 503s until the operation timeout.
    /// A request that may have reached the host is never resent.
    async fn send<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> AppResult<reqwest::Response> {
        let url = format!("{}/fabric/{}", self.base, path);
        let deadline = Instant::now() + self.op_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now()).max(MIN_ATTEMPT);
            let mut req = self.client.request(method.clone(), &url).header(CLUSTER_HEADER, self.cluster.as_str()).timeout(remaining);
            if let Some(b) = body { req = req.json(b); }
            let failure = match req.send().await {
                Ok(resp) if resp.status() == StatusCode::SERVICE_UNAVAILABLE => "grid host is shutting down".to_string(),
                Ok(resp) => {
                    self.reachable.store(true, Ordering::SeqCst);
                    return Ok(resp);
                }
                Err(e) if e.is_connect() => e.to_string(),
                Err(e) => {
                    self.reachable.store(false, Ordering::SeqCst);
                    return Err(AppError::fabric(format!("{} {}: {}", method, url, e)));
                }
            };
            self.reachable.store(false, Ordering::SeqCst);
            if Instant::now() + RETRY_BACKOFF >= deadline {
                return Err(AppError::fabric(format!("grid host {} unreachable for {:?}: {}", self.base, self.op_timeout, failure)));
            }
            debug!(target: "fabric", host = %self.base, error = %failure, "grid host unreachable, retrying");
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> AppResult<T> {
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(AppError::fabric("grid host belongs to a different cluster"));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::internal(format!("fabric {}: HTTP {} {}", path, status, text)));
        }
        resp.json::<T>().await.map_err(|e| AppError::internal(format!("fabric {} reply: {}", path, e)))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<T> {
        let resp = self.send(Method::POST, path, Some(body)).await?;
        Self::decode(path, resp).await
    }

    pub(crate) async fn map_op(&self, map: &str, op: MapOp) -> AppResult<OpResult> {
        let reply: MapReply = self.post("map", &MapRequest { map: map.to_string(), op }).await?;
        self.observe(reply.seq);
        Ok(reply.result)
    }

    pub(crate) async fn next_counter(&self, name: &str) -> AppResult<u64> {
        let reply: CounterReply = self.post("counter", &CounterRequest { name: name.to_string() }).await?;
        Ok(reply.value)
    }

    pub(crate) async fn members(&self) -> AppResult<Vec<MemberInfo>> {
        let resp = self.send(Method::GET, "members", None::<&()>).await?;
        Self::decode("members", resp).await
    }

    /// Long-poll the host for events on `map`, forwarding them until the listener is dropped.
    pub(crate) fn listen(self: &Arc<Self>, map: &str) -> MapListener {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let map = map.to_string();
        let mut after = self.seq.load(Ordering::SeqCst);
        let wait = (self.op_timeout / 2).min(MAX_POLL_WAIT);
        tokio::spawn(async move {
            loop {
                let req = EventsRequest { map: map.clone(), after, wait_ms: wait.as_millis() as u64 };
                let polled = tokio::select! {
                    _ = tx.closed() => break,
                    r = this.post::<_, EventsReply>("events", &req) => r,
                };
                match polled {
                    Ok(reply) => {
                        for ev in reply.events {
                            after = after.max(ev.seq);
                            if tx.send(ev).await.is_err() { return; }
                        }
                    }
                    Err(e) => {
                        debug!(target: "fabric", map = %map, error = %e, "event poll failed");
                        tokio::time::sleep(RETRY_BACKOFF * 5).await;
                    }
                }
            }
        });
        MapListener { source: EventSource::Remote(rx) }
    }

    fn start_heartbeat(self: &Arc<Self>, member: Uuid, every: Duration) {
        let this: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(grid) = this.upgrade() else { break; };
                match grid.send(Method::PUT, &format!("members/{}", member), None::<&()>).await {
                    Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                        warn!(target: "fabric", host = %grid.base, "grid host no longer lists this member");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(target: "fabric", host = %grid.base, error = %e, "heartbeat failed"),
                }
            }
        });
        *self.heartbeat.lock() = Some(task);
    }

    pub(crate) async fn leave(&self, member: &Uuid) {
        if let Some(task) = self.heartbeat.lock().take() { task.abort(); }
        match self.send(Method::DELETE, &format!("members/{}", member), None::<&()>).await {
            Ok(_) => info!(target: "fabric", host = %self.base, "left remote grid"),
            Err(e) => warn!(target: "fabric", host = %self.base, error = %e, "could not leave remote grid"),
        }
    }
}
