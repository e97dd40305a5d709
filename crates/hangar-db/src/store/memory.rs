//! In-process store with optimistic per-record versioning.
//!
//! Transactions stage edits against private copies and record the version
//! each copy was read at. `commit` applies everything at once, or fails
//! with `Error::Conflict` if any staged record was changed or removed in
//! the meantime.

use async_trait::async_trait;
use chrono::Utc;
use hangar_core::{
    Error, Node, NodeMutator, ResourceId, Result, Runner, RunnerFilter, RunnerMutator, Store,
    Transaction,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    record: T,
}

impl<T> Versioned<T> {
    fn new(record: T) -> Self {
        Self { version: 1, record }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<ResourceId, Versioned<Node>>,
    runners: HashMap<ResourceId, Versioned<Runner>>,
}

/// In-memory implementation of `Store`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    pub fn insert_node(&self, node: Node) -> Result<Node> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(&node.id) {
            return Err(Error::Conflict(format!("node {} already exists", node.id)));
        }
        state.nodes.insert(node.id, Versioned::new(node.clone()));
        Ok(node)
    }

    /// Overwrite a node record, e.g. on heartbeat or cordon.
    pub fn put_node(&self, node: Node) -> Result<Node> {
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| Error::NotFound(format!("node {}", node.id)))?;
        entry.version += 1;
        entry.record = node.clone();
        Ok(node)
    }

    /// Record a heartbeat for a node.
    pub fn touch_node(&self, id: ResourceId) -> Result<Node> {
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        entry.version += 1;
        entry.record.updated_at = Utc::now();
        Ok(entry.record.clone())
    }

    /// Set or clear the administrative scheduling ban on a node.
    pub fn cordon_node(&self, id: ResourceId, cordoned: bool) -> Result<Node> {
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        entry.version += 1;
        entry.record.is_cordoned = cordoned;
        Ok(entry.record.clone())
    }

    pub fn remove_node(&self, id: ResourceId) -> Result<Node> {
        self.state
            .lock()
            .nodes
            .remove(&id)
            .map(|v| v.record)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))
    }

    pub fn insert_runner(&self, runner: Runner) -> Result<Runner> {
        let mut state = self.state.lock();
        if state.runners.contains_key(&runner.id) {
            return Err(Error::Conflict(format!(
                "runner {} already exists",
                runner.id
            )));
        }
        state.runners.insert(runner.id, Versioned::new(runner.clone()));
        Ok(runner)
    }

    pub fn remove_runner(&self, id: ResourceId) -> Result<Runner> {
        self.state
            .lock()
            .runners
            .remove(&id)
            .map(|v| v.record)
            .ok_or_else(|| Error::NotFound(format!("runner {}", id)))
    }

    fn read_node(&self, id: ResourceId) -> Result<Versioned<Node>> {
        self.state
            .lock()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))
    }

    fn read_runner(&self, id: ResourceId) -> Result<Versioned<Runner>> {
        self.state
            .lock()
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("runner {}", id)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let state = self.state.lock();
        let mut nodes: Vec<Node> = state.nodes.values().map(|v| v.record.clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn list_runners(&self, filter: RunnerFilter) -> Result<Vec<Runner>> {
        let state = self.state.lock();
        let mut runners: Vec<Runner> = state
            .runners
            .values()
            .map(|v| &v.record)
            .filter(|r| filter.accepts(r))
            .cloned()
            .collect();
        runners.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(runners)
    }

    async fn get_node(&self, id: ResourceId) -> Result<Node> {
        self.read_node(id).map(|v| v.record)
    }

    async fn get_runner(&self, id: ResourceId) -> Result<Runner> {
        self.read_runner(id).map(|v| v.record)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            nodes: HashMap::new(),
            runners: HashMap::new(),
        }))
    }

    async fn reserve_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node> {
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        entry.record.reserve(vcpus, memory_bytes)?;
        entry.version += 1;
        Ok(entry.record.clone())
    }

    async fn release_node_resources(
        &self,
        id: ResourceId,
        vcpus: u64,
        memory_bytes: u64,
    ) -> Result<Node> {
        let mut state = self.state.lock();
        let entry = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        entry.record.release(vcpus, memory_bytes);
        entry.version += 1;
        Ok(entry.record.clone())
    }
}

/// Staged edits against a `MemoryStore`.
pub struct MemoryTransaction {
    store: MemoryStore,
    nodes: HashMap<ResourceId, Versioned<Node>>,
    runners: HashMap<ResourceId, Versioned<Runner>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn update_runner(&mut self, id: ResourceId, mutator: RunnerMutator) -> Result<Runner> {
        let mut staged = match self.runners.get(&id) {
            Some(staged) => staged.clone(),
            None => self.store.read_runner(id)?,
        };
        mutator(&mut staged.record)?;
        staged.record.updated_at = Utc::now();
        let runner = staged.record.clone();
        self.runners.insert(id, staged);
        Ok(runner)
    }

    async fn update_node(&mut self, id: ResourceId, mutator: NodeMutator) -> Result<Node> {
        let mut staged = match self.nodes.get(&id) {
            Some(staged) => staged.clone(),
            None => self.store.read_node(id)?,
        };
        mutator(&mut staged.record)?;
        let node = staged.record.clone();
        self.nodes.insert(id, staged);
        Ok(node)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            store,
            nodes,
            runners,
        } = *self;
        let mut state = store.state.lock();

        for (id, staged) in &nodes {
            match state.nodes.get(id) {
                Some(current) if current.version == staged.version => {}
                Some(_) => return Err(Error::Conflict(format!("node {} changed", id))),
                None => return Err(Error::NotFound(format!("node {}", id))),
            }
        }
        for (id, staged) in &runners {
            match state.runners.get(id) {
                Some(current) if current.version == staged.version => {}
                Some(_) => return Err(Error::Conflict(format!("runner {} changed", id))),
                None => return Err(Error::NotFound(format!("runner {}", id))),
            }
        }

        debug!(
            nodes = nodes.len(),
            runners = runners.len(),
            "Committing transaction"
        );
        for (id, staged) in nodes {
            state.nodes.insert(
                id,
                Versioned {
                    version: staged.version + 1,
                    record: staged.record,
                },
            );
        }
        for (id, staged) in runners {
            state.runners.insert(
                id,
                Versioned {
                    version: staged.version + 1,
                    record: staged.record,
                },
            );
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
