//! Runners: ephemeral CI job executors waiting for, or bound to, a node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::node::BYTES_PER_MB;
use crate::{Error, ResourceId, Result};

/// Runner status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Pending => write!(f, "pending"),
            RunnerStatus::Scheduled => write!(f, "scheduled"),
            RunnerStatus::Running => write!(f, "running"),
            RunnerStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunnerStatus::Pending),
            "scheduled" => Ok(RunnerStatus::Scheduled),
            "running" => Ok(RunnerStatus::Running),
            "completed" => Ok(RunnerStatus::Completed),
            other => Err(Error::InvalidInput(format!("unknown runner status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityOperator {
    In,
    NotIn,
}

/// A constraint on one node label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityExpression {
    pub key: String,
    pub operator: AffinityOperator,
    pub values: Vec<String>,
}

impl AffinityExpression {
    pub fn new(key: impl Into<String>, operator: AffinityOperator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Evaluate against a node's labels. A missing label never matches,
    /// whichever the operator.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let Some(value) = labels.get(&self.key) else {
            return false;
        };
        let listed = self.values.iter().any(|v| v == value);
        match self.operator {
            AffinityOperator::In => listed,
            AffinityOperator::NotIn => !listed,
        }
    }
}

/// A unit of schedulable work: one job execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: ResourceId,
    pub name: String,
    pub organisation: String,
    pub group: String,
    pub vcpus: u64,
    pub memory_mb: u64,
    pub affinity: Vec<AffinityExpression>,
    /// Set once the runner has been assigned.
    pub node_id: Option<ResourceId>,
    pub status: RunnerStatus,
    /// FIFO key for scheduling.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Runner {
    pub fn new(
        name: impl Into<String>,
        organisation: impl Into<String>,
        group: impl Into<String>,
        vcpus: u64,
        memory_mb: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            name: name.into(),
            organisation: organisation.into(),
            group: group.into(),
            vcpus,
            memory_mb,
            affinity: Vec::new(),
            node_id: None,
            status: RunnerStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_affinity(mut self, expr: AffinityExpression) -> Self {
        self.affinity.push(expr);
        self
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn is_assigned(&self) -> bool {
        self.node_id.is_some()
    }

    /// Reject demands that can never be placed meaningfully.
    pub fn validate(&self) -> Result<()> {
        if self.vcpus == 0 {
            return Err(Error::InvalidInput(format!(
                "runner {} requests zero vcpus",
                self.id
            )));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidInput(format!(
                "runner {} requests zero memory",
                self.id
            )));
        }
        Ok(())
    }
}
