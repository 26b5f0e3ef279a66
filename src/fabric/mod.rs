//!
//! camelback cluster fabric
//! ------------------------
//! Process-wide handle to the shared in-memory grid. The grid provides named
//! distributed maps (schema-free, values stored as JSON bytes) and
//! cluster-unique id counters. Session management and the login service hold
//! a `ClusterFabric` and find each other only through well-known map names.
//!
//! Members that share one `Grid` form a cluster. The grid lives in the
//! process that hosts it; `GridServer` exposes it over HTTP and members in
//! other processes join with `ClusterFabric::join_remote`, which fails fast
//! when no seed answers. A remote member keeps its place by heartbeat.
//!
//! An in-process member can be cut off with `Grid::partition`; its
//! operations then block for the configured operation timeout and fail with
//! `FabricUnavailable`, and notifications addressed to it are dropped until
//! `Grid::heal`.

mod grid;
mod ids;
mod map;
mod remote;
mod service;
mod wire;

pub use grid::{ClusterFabric, FabricConfig, Grid, MemberInfo};
pub use ids::IdGenerator;
pub use map::{DistMap, MapEvent, MapEventKind, MapListener, Versioned};
pub use service::{router, GridServer};

/// Cluster-wide registry of issued session ids.
pub const SESSION_IDS_MAP: &str = "sessions.ids";
/// Context paths that own a session map; used for cluster-wide invalidation.
pub const SESSION_CONTEXTS_MAP: &str = "sessions.contexts";
/// Auth token -> principal for everyone currently logged in.
pub const ACTIVE_USERS_MAP: &str = "signaut.activeUsers";

/// Name of the session map backing one context.
pub fn session_map_name(context_path: &str) -> String {
    format!("sessions.{}", context_path)
}
