//! JSON messages exchanged between a grid host and its remote members.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::grid::MemberInfo;
use super::map::MapEvent;

/// Encoded map value, carried as base64 so stored bytes survive the trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Blob(pub(crate) Vec<u8>);

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map(Blob).map_err(serde::de::Error::custom)
    }
}

/// Condition a conditional remove or replace checks against the live entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Expect {
    Any,
    Equal(Blob),
    Version(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum MapOp {
    Get { key: String },
    Put { key: String, value: Blob, ttl_ms: Option<u64> },
    PutIfAbsent { key: String, value: Blob, ttl_ms: Option<u64> },
    Remove { key: String, expect: Expect },
    /// `keep_ttl` carries the replaced entry's remaining TTL over and ignores `ttl_ms`.
    Replace { key: String, value: Blob, keep_ttl: bool, ttl_ms: Option<u64>, expect: Expect },
    Keys,
    Sweep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Stored {
    pub(crate) bytes: Blob,
    pub(crate) version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum OpResult {
    Entry { value: Option<Stored> },
    Previous { value: Option<Blob> },
    Replaced { version: Option<u64> },
    Keys { keys: Vec<String> },
    Count { count: usize },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MapRequest {
    pub(crate) map: String,
    pub(crate) op: MapOp,
}

/// Every map reply carries the grid's notification sequence so a member
/// knows where its listeners should start.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MapReply {
    pub(crate) result: OpResult,
    pub(crate) seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JoinRequest {
    pub(crate) name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JoinReply {
    pub(crate) member: MemberInfo,
    pub(crate) seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EventsRequest {
    pub(crate) map: String,
    /// Only events with a larger sequence are returned.
    pub(crate) after: u64,
    pub(crate) wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CounterRequest {
    pub(crate) name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CounterReply {
    pub(crate) value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EventsReply {
    pub(crate) events: Vec<MapEvent>,
}

/// Header naming the cluster a request belongs to; the host rejects other clusters.
pub(crate) const CLUSTER_HEADER: &str = "x-fabric-cluster";
