//! Transactional store contract consumed by the scheduler.
//!
//! The store owns nodes and runners. The scheduler only reads snapshots of
//! it at startup and writes assignments through a `Transaction`; any
//! serialization of concurrent reservations against the same node is the
//! store's job.

use async_trait::async_trait;

use crate::{Node, ResourceId, Result, Runner};

/// In-place edit of a runner record inside a transaction.
pub type RunnerMutator = Box<dyn FnOnce(&mut Runner) -> Result<()> + Send>;

/// In-place edit of a node record inside a transaction.
pub type NodeMutator = Box<dyn FnOnce(&mut Node) -> Result<()> + Send>;

/// Selection for `Store::list_runners`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerFilter {
    /// Only runners that have not been bound to a node yet.
    pub unassigned_only: bool,
}

impl RunnerFilter {
    pub fn unassigned() -> Self {
        Self {
            unassigned_only: true,
        }
    }

    pub fn accepts(&self, runner: &Runner) -> bool {
        !self.unassigned_only || runner.node_id.is_none()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Runners matching `filter`, oldest `created_at` first.
    async fn list_runners(&self, filter: RunnerFilter) -> Result<Vec<Runner>>;

    async fn get_node(&self, id: ResourceId) -> Result<Node>;

    async fn get_runner(&self, id: ResourceId) -> Result<Runner>;

    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Reserve outside of a scheduling transaction.
    async fn reserve_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node>;

    /// Give back resources, e.g. when a job completes.
    async fn release_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node>;
}

/// A unit of work against the store. Nothing is visible to other readers
/// until `commit` succeeds; dropping without committing discards it.
#[async_trait]
pub trait Transaction: Send {
    async fn update_runner(&mut self, id: ResourceId, mutator: RunnerMutator) -> Result<Runner>;

    async fn update_node(&mut self, id: ResourceId, mutator: NodeMutator) -> Result<Node>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
