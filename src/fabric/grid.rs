use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::ids::IdGenerator;
use super::map::{DistMap, EventSource, MapListener, MapShard};
use super::remote::RemoteGrid;
use super::wire::{MapOp, OpResult};
use crate::error::{AppError, AppResult};

/// Contents of the fabric configuration document (`hazelcastConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    #[serde(default = "FabricConfig::default_cluster_name")]
    pub cluster_name: String,
    /// Defaults to the host name.
    #[serde(default)]
    pub member_name: Option<String>,
    /// How long an operation waits for a partition to heal before failing.
    #[serde(default = "FabricConfig::default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Seed addresses (`host:port` or URLs) of members hosting the grid.
    /// Empty: this process hosts the grid itself.
    #[serde(default)]
    pub members: Vec<String>,
    /// Address the hosted grid is served on for other processes.
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "FabricConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A remote member that has not sent a heartbeat for this long is dropped.
    #[serde(default = "FabricConfig::default_member_ttl_ms")]
    pub member_ttl_ms: u64,
}

impl FabricConfig {
    fn default_cluster_name() -> String { "camelback".to_string() }
    fn default_operation_timeout_ms() -> u64 { 5_000 }
    fn default_heartbeat_interval_ms() -> u64 { 1_000 }
    fn default_member_ttl_ms() -> u64 { 10_000 }

    pub fn load(path: &Path) -> AppResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| AppError::config(format!("fabric config {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::config(format!("fabric config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.operation_timeout_ms == 0 { return Err(AppError::config("operationTimeoutMs must be non-zero")); }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.member_ttl_ms {
            return Err(AppError::config("heartbeatIntervalMs must be non-zero and below memberTtlMs"));
        }
        if let Some(addr) = &self.listen { self.listen_addr_of(addr)?; }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration { Duration::from_millis(self.operation_timeout_ms) }

    pub fn heartbeat_interval(&self) -> Duration { Duration::from_millis(self.heartbeat_interval_ms) }

    pub fn member_ttl(&self) -> Duration { Duration::from_millis(self.member_ttl_ms) }

    /// The parsed `listen` address, if the hosted grid should be served.
    pub fn listen_addr(&self) -> AppResult<Option<std::net::SocketAddr>> {
        self.listen.as_deref().map(|a| self.listen_addr_of(a)).transpose()
    }

    fn listen_addr_of(&self, addr: &str) -> AppResult<std::net::SocketAddr> {
        addr.parse().map_err(|e| AppError::config(format!("fabric listen address {}: {}", addr, e)))
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            cluster_name: Self::default_cluster_name(),
            member_name: None,
            operation_timeout_ms: Self::default_operation_timeout_ms(),
            members: Vec::new(),
            listen: None,
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            member_ttl_ms: Self::default_member_ttl_ms(),
        }
    }
}

/// Identity of one grid member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub uuid: Uuid,
    pub name: String,
    pub ordinal: u64,
    /// Short string unique per member, appended to session ids.
    pub worker_suffix: String,
}

pub(crate) struct MemberLink {
    pub(crate) info: MemberInfo,
    reachable: watch::Sender<bool>,
    /// Notification sequence ranges (exclusive start, inclusive end) during
    /// which this member was cut off. An open range means still partitioned.
    blackouts: Mutex<Vec<(u64, Option<u64>)>>,
    /// Last heartbeat of a member in another process; `None` for in-process members.
    last_seen: Mutex<Option<Instant>>,
}

impl MemberLink {
    pub(crate) fn new(info: MemberInfo, last_seen: Option<Instant>) -> Self {
        let (reachable, _) = watch::channel(true);
        Self { info, reachable, blackouts: Mutex::new(Vec::new()), last_seen: Mutex::new(last_seen) }
    }

    pub(crate) fn is_reachable(&self) -> bool { *self.reachable.borrow() }

    /// True if a notification with this sequence was emitted during a partition.
    pub(crate) fn missed(&self, seq: u64) -> bool {
        self.blackouts.lock().iter().any(|(start, end)| seq > *start && end.map(|e| seq <= e).unwrap_or(true))
    }

    fn stale(&self, ttl: Duration) -> bool {
        self.last_seen.lock().map(|t| t.elapsed() >= ttl).unwrap_or(false)
    }
}

struct GridInner {
    config: FabricConfig,
    running: AtomicBool,
    event_seq: Arc<AtomicU64>,
    maps: RwLock<HashMap<String, Arc<MapShard>>>,
    counters: Mutex<HashMap<String, u64>>,
    members: RwLock<HashMap<Uuid, Arc<MemberLink>>>,
}

/// The shared grid, held by the process that hosts it. Clones refer to the
/// same cluster state; other processes reach it through `GridServer`.
#[derive(Clone)]
pub struct Grid {
    inner: Arc<GridInner>,
}

impl Grid {
    pub fn start(config: FabricConfig) -> Self {
        info!(target: "fabric", cluster = %config.cluster_name, "grid started");
        Self {
            inner: Arc::new(GridInner {
                config,
                running: AtomicBool::new(true),
                event_seq: Arc::new(AtomicU64::new(0)),
                maps: RwLock::new(HashMap::new()),
                counters: Mutex::new(HashMap::new()),
                members: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &FabricConfig { &self.inner.config }

    pub fn is_running(&self) -> bool { self.inner.running.load(Ordering::SeqCst) }

    fn admit(&self, name: String, last_seen: Option<Instant>) -> AppResult<Arc<MemberLink>> {
        if !self.is_running() {
            return Err(AppError::fabric(format!("grid '{}' is not running", self.inner.config.cluster_name)));
        }
        let ordinal = self.next_counter("members");
        let info = MemberInfo { uuid: Uuid::new_v4(), name, ordinal, worker_suffix: format!("w{}", ordinal) };
        let link = Arc::new(MemberLink::new(info.clone(), last_seen));
        self.inner.members.write().insert(info.uuid, link.clone());
        let remote = last_seen.is_some();
        info!(target: "fabric", member = %info.name, worker = %info.worker_suffix, remote = remote, "member joined");
        Ok(link)
    }

    /// Join the grid as a new in-process member.
    pub fn join(&self, member_name: Option<&str>) -> AppResult<ClusterFabric> {
        let name = member_name
            .map(|s| s.to_string())
            .or_else(|| self.inner.config.member_name.clone())
            .unwrap_or_else(default_member_name);
        let link = self.admit(name, None)?;
        Ok(ClusterFabric { backend: Backend::Local(self.clone()), link })
    }

    /// Register a member living in another process; it must keep sending heartbeats.
    pub(crate) fn admit_remote(&self, name: &str) -> AppResult<MemberInfo> {
        Ok(self.admit(name.to_string(), Some(Instant::now()))?.info.clone())
    }

    /// Record a heartbeat. False if the member is unknown or was dropped.
    pub(crate) fn touch(&self, member: &Uuid) -> bool {
        match self.inner.members.read().get(member) {
            Some(link) => {
                let mut seen = link.last_seen.lock();
                if seen.is_some() { *seen = Some(Instant::now()); }
                true
            }
            None => false,
        }
    }

    /// Live members, ordered by ordinal. Remote members past their heartbeat TTL are dropped first.
    pub fn members(&self) -> Vec<MemberInfo> {
        let ttl = self.inner.config.member_ttl();
        self.inner.members.write().retain(|_, link| {
            let stale = link.stale(ttl);
            if stale { warn!(target: "fabric", member = %link.info.name, worker = %link.info.worker_suffix, "member missed its heartbeats, dropped"); }
            !stale
        });
        let mut out: Vec<MemberInfo> = self.inner.members.read().values().map(|l| l.info.clone()).collect();
        out.sort_by_key(|m| m.ordinal);
        out
    }

    /// Cut a member off from the rest of the grid.
    pub fn partition(&self, member: &Uuid) {
        if let Some(link) = self.inner.members.read().get(member) {
            if !link.is_reachable() { return; }
            link.blackouts.lock().push((self.event_seq(), None));
            link.reachable.send_replace(false);
            warn!(target: "fabric", member = %link.info.name, "member partitioned");
        }
    }

    pub fn heal(&self, member: &Uuid) {
        if let Some(link) = self.inner.members.read().get(member) {
            if link.is_reachable() { return; }
            let now = self.event_seq();
            if let Some(last) = link.blackouts.lock().last_mut() { last.1 = Some(now); }
            link.reachable.send_replace(true);
            info!(target: "fabric", member = %link.info.name, "partition healed");
        }
    }

    /// Stop the grid; later joins and operations fail with `FabricUnavailable`.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        info!(target: "fabric", cluster = %self.inner.config.cluster_name, "grid stopped");
    }

    pub(crate) fn event_seq(&self) -> u64 { self.inner.event_seq.load(Ordering::SeqCst) }

    pub(crate) fn shard(&self, name: &str) -> Arc<MapShard> {
        if let Some(s) = self.inner.maps.read().get(name).cloned() { return s; }
        let mut w = self.inner.maps.write();
        w.entry(name.to_string()).or_insert_with(|| Arc::new(MapShard::new(name, self.inner.event_seq.clone()))).clone()
    }

    pub(crate) fn next_counter(&self, name: &str) -> u64 {
        let mut c = self.inner.counters.lock();
        let slot = c.entry(name.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    pub(crate) fn remove_member(&self, member: &Uuid) {
        if let Some(link) = self.inner.members.write().remove(member) {
            info!(target: "fabric", member = %link.info.name, "member left");
        }
    }
}

fn default_member_name() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "camelback".to_string())
}

#[derive(Clone)]
enum Backend {
    Local(Grid),
    Remote(Arc<RemoteGrid>),
}

/// One member's handle to the grid, hosted in this process or reached over HTTP.
#[derive(Clone)]
pub struct ClusterFabric {
    backend: Backend,
    link: Arc<MemberLink>,
}

impl ClusterFabric {
    /// Join the grid hosted by the first reachable seed in `config.members`.
    /// Fails with `FabricUnavailable` if none answers within the operation timeout.
    pub async fn join_remote(config: &FabricConfig) -> AppResult<Self> {
        let name = config.member_name.clone().unwrap_or_else(default_member_name);
        let (remote, info) = RemoteGrid::join(config, &name).await?;
        Ok(Self { backend: Backend::Remote(remote), link: Arc::new(MemberLink::new(info, None)) })
    }

    pub fn member(&self) -> &MemberInfo { &self.link.info }

    pub fn worker_suffix(&self) -> &str { &self.link.info.worker_suffix }

    pub fn is_remote(&self) -> bool { matches!(self.backend, Backend::Remote(_)) }

    pub fn is_reachable(&self) -> bool {
        match &self.backend {
            Backend::Local(grid) => grid.is_running() && self.link.is_reachable(),
            Backend::Remote(remote) => remote.is_reachable(),
        }
    }

    pub fn map<V: Serialize + DeserializeOwned>(&self, name: &str) -> DistMap<V> {
        DistMap::new(name, self.clone())
    }

    pub fn id_generator(&self, name: &str) -> IdGenerator {
        IdGenerator::new(self.clone(), name)
    }

    pub(crate) async fn execute(&self, map: &str, op: MapOp) -> AppResult<OpResult> {
        match &self.backend {
            Backend::Local(grid) => {
                self.ready(grid).await?;
                Ok(grid.shard(map).apply(op))
            }
            Backend::Remote(remote) => remote.map_op(map, op).await,
        }
    }

    pub(crate) fn listen(&self, map: &str) -> MapListener {
        match &self.backend {
            Backend::Local(grid) => MapListener { source: EventSource::Local { rx: grid.shard(map).subscribe_events(), link: self.link.clone() } },
            Backend::Remote(remote) => remote.listen(map),
        }
    }

    pub(crate) async fn next_counter(&self, name: &str) -> AppResult<u64> {
        match &self.backend {
            Backend::Local(grid) => {
                self.ready(grid).await?;
                Ok(grid.next_counter(name))
            }
            Backend::Remote(remote) => remote.next_counter(name).await,
        }
    }

    /// Members currently in the cluster, this one included.
    pub async fn members(&self) -> AppResult<Vec<MemberInfo>> {
        match &self.backend {
            Backend::Local(grid) => {
                self.ready(grid).await?;
                Ok(grid.members())
            }
            Backend::Remote(remote) => remote.members().await,
        }
    }

    /// Wait until this member can reach the grid, bounded by the operation timeout.
    async fn ready(&self, grid: &Grid) -> AppResult<()> {
        if !grid.is_running() {
            return Err(AppError::fabric("grid is not running"));
        }
        if self.link.is_reachable() { return Ok(()); }
        let mut rx = self.link.reachable.subscribe();
        let timeout = grid.config().operation_timeout();
        let healed = matches!(
            tokio::time::timeout(timeout, async { rx.wait_for(|reachable| *reachable).await.is_ok() }).await,
            Ok(true)
        );
        if healed { return Ok(()); }
        Err(AppError::fabric(format!("member {} partitioned for longer than {:?}", self.link.info.name, timeout)))
    }

    pub async fn leave(&self) {
        match &self.backend {
            Backend::Local(grid) => grid.remove_member(&self.link.info.uuid),
            Backend::Remote(remote) => remote.leave(&self.link.info.uuid).await,
        }
    }
}
