//! Scheduler error types.

use hangar_core::ResourceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("dequeue cancelled")]
    Cancelled,

    #[error("runner {0} is not in flight")]
    NotInFlight(ResourceId),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] hangar_core::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("scheduler already started")]
    AlreadyStarted,
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
