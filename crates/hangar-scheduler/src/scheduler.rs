//! The scheduling loop.
//!
//! A single task drains the queue. For each runner it filters and scores
//! a private copy of the node cache, then binds the runner and reserves
//! the node's resources in one store transaction.

use hangar_config::SchedulerConfig;
use hangar_core::{
    Error, Node, NodeStatus, ResourceId, Runner, RunnerFilter, RunnerStatus, Store, Transaction,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::NodeCache;
use crate::error::{QueueError, SchedulerError, SchedulerResult};
use crate::profile::{Feasibility, SchedulingProfile};
use crate::queue::{Parked, QueuedItem, SchedulingQueue};

/// What a single scheduling pass did with the runner it dequeued.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulingOutcome {
    Assigned {
        runner_id: ResourceId,
        node_id: ResourceId,
    },
    /// No node can take the runner right now.
    Blocked {
        runner_id: ResourceId,
        attempts: u32,
    },
    /// Node state changed while the runner was being evaluated, so it was
    /// put back in line instead of being blocked.
    Retried {
        runner_id: ResourceId,
        attempts: u32,
    },
    /// The assignment transaction failed; the runner is back in line.
    Requeued { runner_id: ResourceId },
    /// The runner was withdrawn or already bound elsewhere.
    Dropped { runner_id: ResourceId },
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Matches queued runners to cached nodes.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    pub(crate) queue: Arc<SchedulingQueue>,
    pub(crate) cache: Arc<NodeCache>,
    profile: Arc<SchedulingProfile>,
    retry_backoff: Duration,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: &SchedulerConfig) -> Self {
        Self::with_components(
            store,
            Arc::new(SchedulingQueue::new()),
            Arc::new(NodeCache::new()),
            SchedulingProfile::from_config(config),
            config.retry_backoff,
        )
    }

    pub fn with_components(
        store: Arc<dyn Store>,
        queue: Arc<SchedulingQueue>,
        cache: Arc<NodeCache>,
        profile: SchedulingProfile,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            profile: Arc::new(profile),
            retry_backoff,
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Load every node into the cache and every unassigned runner into the
    /// queue, so a restart neither loses nor reorders pending work.
    pub async fn init(&self) -> SchedulerResult<()> {
        let nodes = self.store.list_nodes().await?;
        let node_count = nodes.len();
        for node in nodes {
            self.cache.add_node(node);
        }

        let runners = self.store.list_runners(RunnerFilter::unassigned()).await?;
        let runner_count = runners.len();
        for runner in runners {
            self.queue.enqueue(runner)?;
        }

        info!(
            nodes = node_count,
            runners = runner_count,
            "Loaded scheduler state"
        );
        Ok(())
    }

    /// Load state and spawn the scheduling loop. The loop stops when `ctx`
    /// is cancelled or `shutdown` is called.
    pub async fn start(&self, ctx: CancellationToken) -> SchedulerResult<()> {
        if self.worker.lock().is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.init().await?;

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        let cancel = ctx.child_token();
        let handle = tokio::spawn(self.clone().run(cancel.clone()));
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stop the loop, close the queue and wait for the loop to exit.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        self.queue.close();

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                error!(error = %e, "Scheduler loop panicked");
            }
        }
        info!("Scheduler stopped");
    }

    /// Validate and enqueue a new runner.
    pub fn schedule(&self, runner: Runner) -> SchedulerResult<()> {
        runner.validate()?;
        self.add_to_queue(runner)?;
        Ok(())
    }

    /// Enqueue without validation. Returns `false` for a runner that is
    /// already queued.
    pub fn add_to_queue(&self, runner: Runner) -> SchedulerResult<bool> {
        let runner_id = runner.id;
        let added = self.queue.enqueue(runner)?;
        if added {
            debug!(runner_id = %runner_id, "Runner queued");
        }
        Ok(added)
    }

    /// Withdraw a runner that no longer needs placing.
    pub fn remove_runner(&self, id: ResourceId) -> bool {
        self.queue.remove(id)
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            filters = ?self.profile.filter_names(),
            scorers = ?self.profile.scorer_names(),
            "Starting scheduler loop"
        );

        loop {
            match self.schedule_next(&cancel).await {
                Ok(SchedulingOutcome::Requeued { .. }) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Ok(_) => {}
                Err(SchedulerError::Queue(QueueError::Closed)) => {
                    info!("Queue closed");
                    break;
                }
                Err(SchedulerError::Queue(QueueError::Cancelled)) => break,
                Err(e) => error!(error = %e, "Scheduling pass failed"),
            }
        }

        info!("Scheduler loop stopped");
    }

    /// Wait for the next runner and try to place it.
    pub async fn schedule_next(
        &self,
        cancel: &CancellationToken,
    ) -> SchedulerResult<SchedulingOutcome> {
        let item = self.queue.dequeue(cancel).await?;
        Ok(self.schedule_one(item).await)
    }

    #[instrument(skip(self, item), fields(runner_id = %item.runner.id, attempts = item.attempts))]
    async fn schedule_one(&self, item: QueuedItem) -> SchedulingOutcome {
        let runner = item.runner;
        let snapshot = self.cache.deep_copy();

        let Feasibility {
            feasible,
            rejections,
        } = self.profile.feasible_nodes(&runner, snapshot.get_nodes());
        if feasible.is_empty() {
            debug!(nodes = snapshot.len(), ?rejections, "No feasible node");
            return self.block(runner.id);
        }

        let Some(best) = self.profile.best_node(feasible) else {
            debug!("No feasible node could be scored");
            return self.block(runner.id);
        };
        let node_id = best.node.id;

        // The node may have been deregistered after the snapshot was taken.
        if !self.cache.contains(node_id) {
            debug!(node_id = %node_id, "Chosen node left the cache");
            return self.requeue(runner.id);
        }

        match self.assign(&runner, node_id).await {
            Ok((runner, node)) => {
                // Only the allocation is ours to write; anything else on the
                // cached node may be newer than this transaction.
                if !self.cache.apply_reservation(node_id, &node.cpu, &node.ram) {
                    warn!(node_id = %node_id, "Assigned to a node no longer cached");
                }
                self.queue.remove(runner.id);
                info!(node_id = %node_id, score = best.score, "Runner assigned");
                SchedulingOutcome::Assigned {
                    runner_id: runner.id,
                    node_id,
                }
            }
            Err(e) => self.recover(runner, node_id, e).await,
        }
    }

    /// Bind the runner and reserve its demand on the node, atomically.
    async fn assign(&self, runner: &Runner, node_id: ResourceId) -> hangar_core::Result<(Runner, Node)> {
        let mut tx = self.store.begin().await?;
        match Self::reserve(tx.as_mut(), runner.id, node_id).await {
            Ok(assigned) => {
                tx.commit().await?;
                Ok(assigned)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn reserve(
        tx: &mut dyn Transaction,
        runner_id: ResourceId,
        node_id: ResourceId,
    ) -> hangar_core::Result<(Runner, Node)> {
        let runner = tx
            .update_runner(
                runner_id,
                Box::new(move |r: &mut Runner| {
                    if let Some(existing) = r.node_id {
                        return Err(Error::Conflict(format!(
                            "runner {} already assigned to node {}",
                            r.id, existing
                        )));
                    }
                    r.node_id = Some(node_id);
                    r.status = RunnerStatus::Scheduled;
                    Ok(())
                }),
            )
            .await?;

        let vcpus = runner.vcpus;
        let memory_bytes = runner.memory_bytes();
        let node = tx
            .update_node(
                node_id,
                Box::new(move |n: &mut Node| {
                    if n.is_cordoned || n.status != NodeStatus::Online {
                        return Err(Error::Conflict(format!(
                            "node {} is no longer schedulable ({}, cordoned: {})",
                            n.id, n.status, n.is_cordoned
                        )));
                    }
                    n.reserve(vcpus, memory_bytes)
                }),
            )
            .await?;

        Ok((runner, node))
    }

    /// Decide what happens to a runner whose assignment transaction failed.
    async fn recover(&self, runner: Runner, node_id: ResourceId, err: Error) -> SchedulingOutcome {
        warn!(node_id = %node_id, error = %err, "Assignment transaction failed");

        match self.store.get_runner(runner.id).await {
            Ok(current) if current.is_assigned() => {
                info!("Runner already assigned, dropping");
                self.queue.remove(runner.id);
                return SchedulingOutcome::Dropped {
                    runner_id: runner.id,
                };
            }
            Err(Error::NotFound(_)) => {
                info!("Runner no longer exists, dropping");
                self.queue.remove(runner.id);
                return SchedulingOutcome::Dropped {
                    runner_id: runner.id,
                };
            }
            _ => {}
        }

        // Our view of the node was behind the store's; catch up before retrying.
        if err.is_stale_view() || matches!(err, Error::NotFound(_)) {
            match self.store.get_node(node_id).await {
                Ok(node) => {
                    self.cache.put_node(node);
                }
                Err(Error::NotFound(_)) => {
                    self.cache.del_node(node_id);
                }
                Err(e) => warn!(node_id = %node_id, error = %e, "Could not refresh node"),
            }
        }

        self.requeue(runner.id)
    }

    fn block(&self, runner_id: ResourceId) -> SchedulingOutcome {
        match self.queue.block(runner_id) {
            Ok(Parked::Blocked { attempts }) => {
                debug!(attempts, "Runner blocked");
                SchedulingOutcome::Blocked {
                    runner_id,
                    attempts,
                }
            }
            Ok(Parked::Retry { attempts }) => SchedulingOutcome::Retried {
                runner_id,
                attempts,
            },
            // Removed while we were looking at it.
            Err(_) => SchedulingOutcome::Dropped { runner_id },
        }
    }

    fn requeue(&self, runner_id: ResourceId) -> SchedulingOutcome {
        match self.queue.requeue(runner_id) {
            Ok(()) => SchedulingOutcome::Requeued { runner_id },
            Err(_) => SchedulingOutcome::Dropped { runner_id },
        }
    }
}
