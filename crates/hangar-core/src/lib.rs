//! Core domain types and traits for the Hangar runner scheduler.
//!
//! This crate contains:
//! - Resource identifiers
//! - Node and resource accounting types
//! - Runner and affinity types
//! - The transactional `Store` abstraction the scheduler writes through

pub mod error;
pub mod id;
pub mod node;
pub mod runner;
pub mod store;

pub use error::{Error, Result};
pub use id::ResourceId;
pub use node::{Node, NodeStatus, Resource};
pub use runner::{AffinityExpression, AffinityOperator, Runner, RunnerStatus};
pub use store::{NodeMutator, RunnerFilter, RunnerMutator, Store, Transaction};
