//! Compute hosts and their resource accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, ResourceId, Result};

/// Bytes in one mebibyte, the unit runners request memory in.
pub const BYTES_PER_MB: u64 = 1024 * 1024;
pub const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Cordoned,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "unknown"),
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Cordoned => write!(f, "cordoned"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(NodeStatus::Unknown),
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "cordoned" => Ok(NodeStatus::Cordoned),
            other => Err(Error::InvalidInput(format!("unknown node status: {other}"))),
        }
    }
}

/// A finite, optionally oversubscribed resource on a node.
///
/// `allocated` never exceeds `capacity * overcommit_ratio` once a
/// reservation has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub capacity: u64,
    pub allocated: u64,
    pub overcommit_ratio: f64,
}

impl Resource {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated: 0,
            overcommit_ratio: 1.0,
        }
    }

    pub fn with_overcommit(mut self, ratio: f64) -> Self {
        self.overcommit_ratio = ratio;
        self
    }

    /// Soft limit reservations are checked against.
    pub fn limit(&self) -> f64 {
        self.capacity as f64 * self.overcommit_ratio
    }

    /// Headroom left under the soft limit. Negative only if the record was
    /// written by something that bypassed `reserve`.
    pub fn free(&self) -> f64 {
        self.limit() - self.allocated as f64
    }

    pub fn can_fit(&self, amount: u64) -> bool {
        match self.allocated.checked_add(amount) {
            Some(total) => total as f64 <= self.limit(),
            None => false,
        }
    }

    fn reserve(&mut self, amount: u64) -> bool {
        if !self.can_fit(amount) {
            return false;
        }
        self.allocated += amount;
        true
    }

    fn release(&mut self, amount: u64) {
        self.allocated = self.allocated.saturating_sub(amount);
    }
}

/// A registered compute host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: ResourceId,
    pub name: String,
    pub organisation: String,
    pub group: String,
    pub status: NodeStatus,
    pub labels: HashMap<String, String>,
    /// vCPUs.
    pub cpu: Resource,
    /// Bytes.
    pub ram: Resource,
    /// Administrative scheduling ban, independent of `status`.
    pub is_cordoned: bool,
    pub created_at: DateTime<Utc>,
    /// Last heartbeat.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A freshly registered, online node with nothing allocated.
    pub fn new(
        name: impl Into<String>,
        organisation: impl Into<String>,
        group: impl Into<String>,
        cpu: Resource,
        ram: Resource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            name: name.into(),
            organisation: organisation.into(),
            group: group.into(),
            status: NodeStatus::Online,
            labels: HashMap::new(),
            cpu,
            ram,
            is_cordoned: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Reserve CPU and RAM together. Either both are taken or neither is.
    pub fn reserve(&mut self, vcpus: u64, memory_bytes: u64) -> Result<()> {
        if !self.cpu.can_fit(vcpus) {
            return Err(self.shortfall("cpu", vcpus, self.cpu.free()));
        }
        if !self.ram.can_fit(memory_bytes) {
            return Err(self.shortfall("ram", memory_bytes, self.ram.free()));
        }
        self.cpu.reserve(vcpus);
        self.ram.reserve(memory_bytes);
        Ok(())
    }

    pub fn release(&mut self, vcpus: u64, memory_bytes: u64) {
        self.cpu.release(vcpus);
        self.ram.release(memory_bytes);
    }

    fn shortfall(&self, resource: &'static str, requested: u64, free: f64) -> Error {
        Error::InsufficientCapacity {
            node: self.id.to_string(),
            resource,
            requested,
            free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cpu: u64, ram_mb: u64) -> Node {
        Node::new(
            "host-1",
            "acme",
            "default",
            Resource::new(cpu),
            Resource::new(ram_mb * BYTES_PER_MB),
        )
    }

    #[test]
    fn test_can_fit_respects_overcommit() {
        let res = Resource::new(4).with_overcommit(1.5);
        assert!(res.can_fit(6));
        assert!(!res.can_fit(7));
    }

    #[test]
    fn test_reserve_up_to_limit() {
        let mut node = node(4, 1024);
        for _ in 0..4 {
            node.reserve(1, 128 * BYTES_PER_MB).unwrap();
        }
        assert_eq!(node.cpu.allocated, 4);

        let err = node.reserve(1, 128 * BYTES_PER_MB).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCapacity {
                resource: "cpu",
                ..
            }
        ));
        assert_eq!(node.cpu.allocated, 4);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let mut node = node(8, 256);
        let err = node.reserve(2, 512 * BYTES_PER_MB).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCapacity {
                resource: "ram",
                ..
            }
        ));
        assert_eq!(node.cpu.allocated, 0);
        assert_eq!(node.ram.allocated, 0);
    }

    #[test]
    fn test_release_saturates() {
        let mut node = node(4, 1024);
        node.reserve(2, BYTES_PER_MB).unwrap();
        node.release(3, 2 * BYTES_PER_MB);
        assert_eq!(node.cpu.allocated, 0);
        assert_eq!(node.ram.allocated, 0);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("cordoned".parse::<NodeStatus>().unwrap(), NodeStatus::Cordoned);
        assert!("draining".parse::<NodeStatus>().is_err());
        assert_eq!(NodeStatus::Online.to_string(), "online");
    }
}
