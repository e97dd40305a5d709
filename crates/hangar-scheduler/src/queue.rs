//! Scheduling queue for runners awaiting placement.
//!
//! Runners wait in a min-heap keyed by `(created_at, id)`. A dequeued runner
//! is in flight until the scheduler either forgets it (`remove`), parks it
//! (`block`) or puts it back (`requeue`). Blocked runners stay out of the
//! heap until `unblock`/`unblock_all`.
//!
//! Every unblock bumps a generation counter. A runner remembers the
//! generation it was dequeued at; if an unblock ran while it was in flight,
//! `block` puts it straight back in line since its verdict may be stale.
//!
//! Two locks are used: `members` tracks where each runner is, `pending`
//! holds the heap and the closed flag. `members` is always taken first.
//! Neither is held while a consumer waits; waiting goes through `Notify`.

use chrono::{DateTime, Utc};
use hangar_core::{ResourceId, Runner};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, QueueResult};

/// A runner plus queue bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub runner: Runner,
    /// When the runner first entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// How many times the runner has been blocked.
    pub attempts: u32,
}

impl QueuedItem {
    fn new(runner: Runner) -> Self {
        Self {
            runner,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.runner.id
    }
}

/// Where `block` put a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parked {
    Blocked { attempts: u32 },
    /// Node state changed while it was in flight; it is waiting again.
    Retry { attempts: u32 },
}

impl Parked {
    pub fn attempts(&self) -> u32 {
        match self {
            Parked::Blocked { attempts } | Parked::Retry { attempts } => *attempts,
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    created_at: DateTime<Utc>,
    id: ResourceId,
    // Matches `Slot::Waiting::seq` while the entry is live.
    seq: u64,
}

#[derive(Debug)]
enum Slot {
    Waiting { seq: u64, item: QueuedItem },
    InFlight { item: QueuedItem, generation: u64 },
    Blocked(QueuedItem),
}

#[derive(Debug, Default)]
struct Members {
    slots: HashMap<ResourceId, Slot>,
    next_seq: u64,
    unblock_generation: u64,
}

#[derive(Debug, Default)]
struct Pending {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    closed: bool,
}

/// Concurrency-safe FIFO of runners with a side set of blocked runners.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    members: Mutex<Members>,
    pending: Mutex<Pending>,
    available: Notify,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner. Returns `false` if it is already tracked (waiting,
    /// in flight or blocked), which is not an error.
    pub fn enqueue(&self, runner: Runner) -> QueueResult<bool> {
        let mut members = self.members.lock();
        if self.pending.lock().closed {
            return Err(QueueError::Closed);
        }
        if members.slots.contains_key(&runner.id) {
            debug!(runner_id = %runner.id, "Runner already queued");
            return Ok(false);
        }

        self.push_waiting(&mut members, QueuedItem::new(runner));
        drop(members);
        self.available.notify_one();
        Ok(true)
    }

    /// Wait for the earliest runner.
    ///
    /// Returns `QueueError::Closed` once the queue is closed and drained,
    /// or `QueueError::Cancelled` if `cancel` fires first.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> QueueResult<QueuedItem> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent push can't slip between.
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue()? {
                return Ok(item);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Pop the earliest runner without waiting.
    pub fn try_dequeue(&self) -> QueueResult<Option<QueuedItem>> {
        let mut members = self.members.lock();
        let mut pending = self.pending.lock();

        while let Some(Reverse(entry)) = pending.heap.pop() {
            let item = match members.slots.get(&entry.id) {
                Some(Slot::Waiting { seq, item }) if *seq == entry.seq => item.clone(),
                // Removed or re-queued since this entry was pushed.
                _ => continue,
            };
            let generation = members.unblock_generation;
            members.slots.insert(
                entry.id,
                Slot::InFlight {
                    item: item.clone(),
                    generation,
                },
            );
            return Ok(Some(item));
        }

        if pending.closed {
            return Err(QueueError::Closed);
        }
        Ok(None)
    }

    /// Park an in-flight runner that could not be placed. It stays out of
    /// the heap until unblocked, unless an unblock already happened while it
    /// was in flight, in which case it is queued again at once.
    pub fn block(&self, id: ResourceId) -> QueueResult<Parked> {
        let mut members = self.members.lock();
        let (mut item, generation) = match members.slots.get(&id) {
            Some(Slot::InFlight { item, generation }) => (item.clone(), *generation),
            _ => return Err(QueueError::NotInFlight(id)),
        };
        item.attempts += 1;
        let attempts = item.attempts;

        if generation != members.unblock_generation {
            debug!(runner_id = %id, "Nodes changed during pass, retrying");
            self.push_waiting(&mut members, item);
            drop(members);
            self.available.notify_one();
            return Ok(Parked::Retry { attempts });
        }

        members.slots.insert(id, Slot::Blocked(item));
        Ok(Parked::Blocked { attempts })
    }

    /// Return an in-flight runner to the heap with its original ordering.
    pub fn requeue(&self, id: ResourceId) -> QueueResult<()> {
        let mut members = self.members.lock();
        let item = match members.slots.get(&id) {
            Some(Slot::InFlight { item, .. }) => item.clone(),
            _ => return Err(QueueError::NotInFlight(id)),
        };
        self.push_waiting(&mut members, item);
        drop(members);
        self.available.notify_one();
        Ok(())
    }

    /// Move one blocked runner back to the heap. Returns `false` if it was
    /// not blocked.
    pub fn unblock(&self, id: ResourceId) -> bool {
        let mut members = self.members.lock();
        members.unblock_generation += 1;
        let item = match members.slots.get(&id) {
            Some(Slot::Blocked(item)) => item.clone(),
            _ => return false,
        };
        self.push_waiting(&mut members, item);
        drop(members);
        self.available.notify_one();
        true
    }

    /// Move every blocked runner back to the heap. Returns how many moved.
    pub fn unblock_all(&self) -> usize {
        let mut members = self.members.lock();
        members.unblock_generation += 1;
        let blocked: Vec<QueuedItem> = members
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Blocked(item) => Some(item.clone()),
                _ => None,
            })
            .collect();

        let count = blocked.len();
        for item in blocked {
            self.push_waiting(&mut members, item);
        }
        drop(members);

        for _ in 0..count {
            self.available.notify_one();
        }
        if count > 0 {
            debug!(count, "Unblocked runners");
        }
        count
    }

    /// Forget a runner wherever it is. Returns `false` if it was not tracked.
    pub fn remove(&self, id: ResourceId) -> bool {
        // A waiting runner's heap entry goes stale and is skipped on pop.
        self.members.lock().slots.remove(&id).is_some()
    }

    /// Stop accepting runners and wake every waiting consumer. Idempotent.
    pub fn close(&self) {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
        }
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    pub fn is_tracked(&self, id: ResourceId) -> bool {
        self.members.lock().slots.contains_key(&id)
    }

    pub fn is_blocked(&self, id: ResourceId) -> bool {
        matches!(self.members.lock().slots.get(&id), Some(Slot::Blocked(_)))
    }

    /// Runners waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.count(|slot| matches!(slot, Slot::Waiting { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blocked_len(&self) -> usize {
        self.count(|slot| matches!(slot, Slot::Blocked(_)))
    }

    pub fn in_flight_len(&self) -> usize {
        self.count(|slot| matches!(slot, Slot::InFlight { .. }))
    }

    fn count(&self, pred: impl Fn(&Slot) -> bool) -> usize {
        self.members.lock().slots.values().filter(|s| pred(s)).count()
    }

    fn push_waiting(&self, members: &mut Members, item: QueuedItem) {
        let seq = members.next_seq;
        members.next_seq += 1;

        let entry = HeapEntry {
            created_at: item.runner.created_at,
            id: item.runner.id,
            seq,
        };
        self.pending.lock().heap.push(Reverse(entry));
        members.slots.insert(item.runner.id, Slot::Waiting { seq, item });
    }
}
