use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::grid::{ClusterFabric, MemberLink};
use super::wire::{Blob, Expect, MapOp, OpResult, Stored};
use crate::error::{AppError, AppResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEventKind {
    Added,
    Updated,
    Removed,
    Expired,
}

/// Entry-changed notification. Best effort: may be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEvent {
    pub map: String,
    pub key: String,
    pub kind: MapEventKind,
    /// Grid-wide notification sequence number.
    pub seq: u64,
}

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    version: u64,
    /// Optional expiry time
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool { self.expires_at.map(|exp| now < exp).unwrap_or(true) }

    fn satisfies(&self, expect: &Expect) -> bool {
        match expect {
            Expect::Any => true,
            Expect::Equal(b) => self.bytes == b.0,
            Expect::Version(v) => self.version == *v,
        }
    }
}

#[derive(Default)]
struct ShardState {
    entries: HashMap<String, Entry>,
    /// Map-wide write counter; every write stamps the entry with the next value.
    version: u64,
}

impl ShardState {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.live(now))
    }

    fn write(&mut self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>, now: Instant) -> u64 {
        self.version += 1;
        let version = self.version;
        self.entries.insert(key.to_string(), Entry { bytes, version, expires_at: ttl.map(|d| now + d) });
        version
    }
}

/// Storage for one named map, held by the grid host.
pub(crate) struct MapShard {
    name: String,
    state: RwLock<ShardState>,
    events: broadcast::Sender<MapEvent>,
    /// Recent notifications, replayed to remote listeners that poll.
    recent: Mutex<VecDeque<MapEvent>>,
    event_seq: Arc<AtomicU64>,
}

impl MapShard {
    pub(crate) fn new(name: &str, event_seq: Arc<AtomicU64>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { name: name.to_string(), state: RwLock::new(ShardState::default()), events, recent: Mutex::new(VecDeque::new()), event_seq }
    }

    fn emit(&self, key: &str, kind: MapEventKind) {
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ev = MapEvent { map: self.name.clone(), key: key.to_string(), kind, seq };
        {
            let mut recent = self.recent.lock();
            if recent.len() == EVENT_CAPACITY { recent.pop_front(); }
            recent.push_back(ev.clone());
        }
        // No receivers is fine.
        let _ = self.events.send(ev);
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<MapEvent> { self.events.subscribe() }

    /// Buffered events newer than `after`, oldest first.
    pub(crate) fn events_since(&self, after: u64) -> Vec<MapEvent> {
        self.recent.lock().iter().filter(|e| e.seq > after).cloned().collect()
    }

    fn get(&self, key: &str) -> Option<(Vec<u8>, u64)> {
        let now = Instant::now();
        self.state.read().live(key, now).map(|e| (e.bytes.clone(), e.version))
    }

    fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Option<Vec<u8>> {
        let now = Instant::now();
        let prev = {
            let mut w = self.state.write();
            let prev = w.live(key, now).map(|e| e.bytes.clone());
            w.write(key, bytes, ttl, now);
            prev
        };
        self.emit(key, if prev.is_some() { MapEventKind::Updated } else { MapEventKind::Added });
        prev
    }

    fn put_if_absent(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let mut w = self.state.write();
            if let Some(existing) = w.live(key, now) { return Some(existing.bytes.clone()); }
            w.write(key, bytes, ttl, now);
        }
        self.emit(key, MapEventKind::Added);
        None
    }

    fn remove_where(&self, key: &str, expect: &Expect) -> Option<Vec<u8>> {
        let now = Instant::now();
        let removed = {
            let mut w = self.state.write();
            let hit = w.live(key, now).map(|e| e.satisfies(expect)).unwrap_or(false);
            if hit {
                w.version += 1;
                w.entries.remove(key).map(|e| e.bytes)
            } else {
                None
            }
        };
        if removed.is_some() { self.emit(key, MapEventKind::Removed); }
        removed
    }

    /// `ttl: None` keeps the remaining TTL of the entry being replaced.
    fn replace_where(&self, key: &str, bytes: Vec<u8>, ttl: Option<Option<Duration>>, expect: &Expect) -> Option<u64> {
        let now = Instant::now();
        let version = {
            let mut w = self.state.write();
            let Some(e) = w.live(key, now) else { return None; };
            if !e.satisfies(expect) { return None; }
            let ttl = ttl.unwrap_or_else(|| e.expires_at.map(|exp| exp.saturating_duration_since(now)));
            w.write(key, bytes, ttl, now)
        };
        self.emit(key, MapEventKind::Updated);
        Some(version)
    }

    fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.state.read().entries.iter().filter(|(_, e)| e.live(now)).map(|(k, _)| k.clone()).collect()
    }

    /// Remove expired keys. Returns number removed.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut w = self.state.write();
            let keys: Vec<String> = w.entries.iter().filter(|(_, e)| !e.live(now)).map(|(k, _)| k.clone()).collect();
            for k in &keys { w.entries.remove(k); }
            keys
        };
        for k in &expired { self.emit(k, MapEventKind::Expired); }
        expired.len()
    }

    /// Execute one operation, whether issued in-process or by a remote member.
    pub(crate) fn apply(&self, op: MapOp) -> OpResult {
        let ttl = |ms: Option<u64>| ms.map(Duration::from_millis);
        match op {
            MapOp::Get { key } => OpResult::Entry {
                value: self.get(&key).map(|(bytes, version)| Stored { bytes: Blob(bytes), version }),
            },
            MapOp::Put { key, value, ttl_ms } => OpResult::Previous { value: self.put(&key, value.0, ttl(ttl_ms)).map(Blob) },
            MapOp::PutIfAbsent { key, value, ttl_ms } => {
                OpResult::Previous { value: self.put_if_absent(&key, value.0, ttl(ttl_ms)).map(Blob) }
            }
            MapOp::Remove { key, expect } => OpResult::Previous { value: self.remove_where(&key, &expect).map(Blob) },
            MapOp::Replace { key, value, keep_ttl, ttl_ms, expect } => {
                let ttl = if keep_ttl { None } else { Some(ttl(ttl_ms)) };
                OpResult::Replaced { version: self.replace_where(&key, value.0, ttl, &expect) }
            }
            MapOp::Keys => OpResult::Keys { keys: self.keys() },
            MapOp::Sweep => OpResult::Count { count: self.sweep() },
        }
    }
}

/// A value together with the map version at which it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

fn unexpected(r: OpResult) -> AppError {
    AppError::internal(format!("unexpected fabric reply: {:?}", r))
}

fn ttl_ms(ttl: Duration) -> Option<u64> { Some(ttl.as_millis() as u64) }

/// Typed view over a named distributed map.
pub struct DistMap<V> {
    name: String,
    fabric: ClusterFabric,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for DistMap<V> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), fabric: self.fabric.clone(), _marker: PhantomData }
    }
}

impl<V: Serialize + DeserializeOwned> DistMap<V> {
    pub(crate) fn new(name: &str, fabric: ClusterFabric) -> Self {
        Self { name: name.to_string(), fabric, _marker: PhantomData }
    }

    pub fn name(&self) -> &str { &self.name }

    fn encode(v: &V) -> AppResult<Blob> { Ok(Blob(serde_json::to_vec(v)?)) }
    fn decode(b: &[u8]) -> AppResult<V> { Ok(serde_json::from_slice(b)?) }

    async fn previous(&self, op: MapOp) -> AppResult<Option<V>> {
        match self.fabric.execute(&self.name, op).await? {
            OpResult::Previous { value } => value.map(|b| Self::decode(&b.0)).transpose(),
            other => Err(unexpected(other)),
        }
    }

    async fn replaced(&self, op: MapOp) -> AppResult<Option<u64>> {
        match self.fabric.execute(&self.name, op).await? {
            OpResult::Replaced { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<V>> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    pub async fn get_versioned(&self, key: &str) -> AppResult<Option<Versioned<V>>> {
        match self.fabric.execute(&self.name, MapOp::Get { key: key.to_string() }).await? {
            OpResult::Entry { value: Some(s) } => Ok(Some(Versioned { value: Self::decode(&s.bytes.0)?, version: s.version })),
            OpResult::Entry { value: None } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Store a value, returning the previous one.
    pub async fn put(&self, key: &str, value: &V) -> AppResult<Option<V>> {
        self.previous(MapOp::Put { key: key.to_string(), value: Self::encode(value)?, ttl_ms: None }).await
    }

    pub async fn put_with_ttl(&self, key: &str, value: &V, ttl: Duration) -> AppResult<()> {
        self.previous(MapOp::Put { key: key.to_string(), value: Self::encode(value)?, ttl_ms: ttl_ms(ttl) }).await?;
        Ok(())
    }

    /// Insert only if no live entry exists. Returns the existing value otherwise.
    pub async fn put_if_absent(&self, key: &str, value: &V) -> AppResult<Option<V>> {
        self.previous(MapOp::PutIfAbsent { key: key.to_string(), value: Self::encode(value)?, ttl_ms: None }).await
    }

    pub async fn put_if_absent_with_ttl(&self, key: &str, value: &V, ttl: Duration) -> AppResult<Option<V>> {
        self.previous(MapOp::PutIfAbsent { key: key.to_string(), value: Self::encode(value)?, ttl_ms: ttl_ms(ttl) }).await
    }

    pub async fn remove(&self, key: &str) -> AppResult<Option<V>> {
        self.previous(MapOp::Remove { key: key.to_string(), expect: Expect::Any }).await
    }

    /// Remove only if the current value equals `expected`.
    pub async fn remove_if_equal(&self, key: &str, expected: &V) -> AppResult<bool> {
        let op = MapOp::Remove { key: key.to_string(), expect: Expect::Equal(Self::encode(expected)?) };
        Ok(self.previous(op).await?.is_some())
    }

    /// Remove only if the entry is still at `version`.
    pub async fn remove_if_version(&self, key: &str, version: u64) -> AppResult<bool> {
        Ok(self.previous(MapOp::Remove { key: key.to_string(), expect: Expect::Version(version) }).await?.is_some())
    }

    /// Replace only if the current value equals `expected`.
    pub async fn replace_if_equal(&self, key: &str, expected: &V, value: &V) -> AppResult<bool> {
        let op = MapOp::Replace {
            key: key.to_string(),
            value: Self::encode(value)?,
            keep_ttl: true,
            ttl_ms: None,
            expect: Expect::Equal(Self::encode(expected)?),
        };
        Ok(self.replaced(op).await?.is_some())
    }

    /// Like `replace_if_equal`, but sets a fresh TTL (`None` = never expires).
    pub async fn replace_if_equal_with_ttl(&self, key: &str, expected: &V, value: &V, ttl: Option<Duration>) -> AppResult<bool> {
        let op = MapOp::Replace {
            key: key.to_string(),
            value: Self::encode(value)?,
            keep_ttl: false,
            ttl_ms: ttl.and_then(ttl_ms),
            expect: Expect::Equal(Self::encode(expected)?),
        };
        Ok(self.replaced(op).await?.is_some())
    }

    /// Replace only if the entry is still at `version`; returns the new version.
    pub async fn replace_if_version(&self, key: &str, version: u64, value: &V) -> AppResult<Option<u64>> {
        let op = MapOp::Replace { key: key.to_string(), value: Self::encode(value)?, keep_ttl: true, ttl_ms: None, expect: Expect::Version(version) };
        self.replaced(op).await
    }

    pub async fn keys(&self) -> AppResult<Vec<String>> {
        match self.fabric.execute(&self.name, MapOp::Keys).await? {
            OpResult::Keys { keys } => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    pub async fn len(&self) -> AppResult<usize> { Ok(self.keys().await?.len()) }

    pub async fn is_empty(&self) -> AppResult<bool> { Ok(self.len().await? == 0) }

    pub async fn evict_expired(&self) -> AppResult<usize> {
        match self.fabric.execute(&self.name, MapOp::Sweep).await? {
            OpResult::Count { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Start listening. In-process members see every later change; remote
    /// members see changes newer than the last reply they got from the host.
    pub fn subscribe(&self) -> MapListener { self.fabric.listen(&self.name) }
}

pub(crate) enum EventSource {
    Local { rx: broadcast::Receiver<MapEvent>, link: Arc<MemberLink> },
    Remote(mpsc::Receiver<MapEvent>),
}

/// Receives entry-changed notifications for one member.
pub struct MapListener {
    pub(crate) source: EventSource,
}

impl MapListener {
    /// Next event, or `None` once the map is gone. Events emitted while the
    /// member was partitioned are dropped; a lagging listener skips ahead.
    pub async fn recv(&mut self) -> Option<MapEvent> {
        match &mut self.source {
            EventSource::Remote(rx) => rx.recv().await,
            EventSource::Local { rx, link } => loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if !link.missed(ev.seq) { return Some(ev); }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(target: "fabric", skipped = n, "listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}
