use super::grid::ClusterFabric;
use crate::error::AppResult;

/// Cluster-wide counter. Values are unique and increasing for the lifetime
/// of the grid; nothing is promised across restarts.
#[derive(Clone)]
pub struct IdGenerator {
    fabric: ClusterFabric,
    name: String,
}

impl IdGenerator {
    pub(crate) fn new(fabric: ClusterFabric, name: &str) -> Self {
        Self { fabric, name: format!("ids.{}", name) }
    }

    pub async fn next_id(&self) -> AppResult<u64> {
        self.fabric.next_counter(&self.name).await
    }
}
