//! KDL configuration parsing for the Hangar scheduler.
//!
//! This crate handles parsing of:
//! - Feasibility filter selection
//! - Scorer multipliers
//! - Scheduler loop timing

pub mod error;
pub mod scheduler;

pub use error::{ConfigError, ConfigResult};
pub use scheduler::{
    FilterKind, ScorerConfig, ScorerKind, SchedulerConfig, load_scheduler_config,
    parse_scheduler_config,
};
