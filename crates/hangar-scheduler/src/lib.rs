//! Runner-to-node scheduling.
//!
//! Runners wait in a [`SchedulingQueue`]; a single loop takes them one at a
//! time, filters and scores a snapshot of the [`NodeCache`], and records the
//! placement through the [`hangar_core::Store`] transaction API.

pub mod cache;
pub mod error;
mod events;
pub mod filter;
pub mod profile;
pub mod queue;
pub mod scheduler;
pub mod score;

pub use cache::NodeCache;
pub use error::{QueueError, QueueResult, SchedulerError, SchedulerResult};
pub use filter::{Filter, Verdict, build_filter};
pub use profile::{Feasibility, ScoredNode, SchedulingProfile};
pub use queue::{Parked, QueuedItem, SchedulingQueue};
pub use scheduler::{Scheduler, SchedulingOutcome};
pub use score::{Scorer, build_scorer};
