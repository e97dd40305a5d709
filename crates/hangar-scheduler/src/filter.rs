//! Feasibility filters.
//!
//! Each filter decides whether one node can take one runner. A node is
//! feasible only if every configured filter accepts it; order only affects
//! how early a rejection short-circuits.

use chrono::{Duration as ChronoDuration, Utc};
use hangar_config::{FilterKind, SchedulerConfig};
use hangar_core::{Node, NodeStatus, Runner};

/// Why a filter turned a node down.
pub type Verdict = std::result::Result<(), String>;

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict;
}

/// Build the filter for `kind` with the tuning in `config`.
pub fn build_filter(kind: FilterKind, config: &SchedulerConfig) -> Box<dyn Filter> {
    match kind {
        FilterKind::Status => Box::new(StatusFilter),
        FilterKind::Cordon => Box::new(CordonFilter),
        FilterKind::Heartbeat => Box::new(HeartbeatFilter::new(config.heartbeat_timeout)),
        FilterKind::Organisation => Box::new(OrganisationFilter),
        FilterKind::Group => Box::new(GroupFilter),
        FilterKind::CpuCapacity => Box::new(CpuCapacityFilter),
        FilterKind::RamCapacity => Box::new(RamCapacityFilter),
        FilterKind::Affinity => Box::new(AffinityFilter),
    }
}

/// Node must be online.
pub struct StatusFilter;

impl Filter for StatusFilter {
    fn name(&self) -> &'static str {
        FilterKind::Status.name()
    }

    fn filter(&self, _runner: &Runner, node: &Node) -> Verdict {
        if node.status == NodeStatus::Online {
            Ok(())
        } else {
            Err(format!("node is {}", node.status))
        }
    }
}

/// Node must not be administratively cordoned.
pub struct CordonFilter;

impl Filter for CordonFilter {
    fn name(&self) -> &'static str {
        FilterKind::Cordon.name()
    }

    fn filter(&self, _runner: &Runner, node: &Node) -> Verdict {
        if node.is_cordoned {
            Err("node is cordoned".to_string())
        } else {
            Ok(())
        }
    }
}

/// Node must have reported in recently.
pub struct HeartbeatFilter {
    timeout: ChronoDuration,
}

impl HeartbeatFilter {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            timeout: ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::MAX),
        }
    }
}

impl Filter for HeartbeatFilter {
    fn name(&self) -> &'static str {
        FilterKind::Heartbeat.name()
    }

    fn filter(&self, _runner: &Runner, node: &Node) -> Verdict {
        let age = Utc::now().signed_duration_since(node.updated_at);
        if age <= self.timeout {
            Ok(())
        } else {
            Err(format!("last heartbeat {}s ago", age.num_seconds()))
        }
    }
}

/// Tenancy isolation between organisations.
pub struct OrganisationFilter;

impl Filter for OrganisationFilter {
    fn name(&self) -> &'static str {
        FilterKind::Organisation.name()
    }

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict {
        if runner.organisation == node.organisation {
            Ok(())
        } else {
            Err(format!("node belongs to organisation {}", node.organisation))
        }
    }
}

pub struct GroupFilter;

impl Filter for GroupFilter {
    fn name(&self) -> &'static str {
        FilterKind::Group.name()
    }

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict {
        if runner.group == node.group {
            Ok(())
        } else {
            Err(format!("node belongs to group {}", node.group))
        }
    }
}

pub struct CpuCapacityFilter;

impl Filter for CpuCapacityFilter {
    fn name(&self) -> &'static str {
        FilterKind::CpuCapacity.name()
    }

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict {
        if node.cpu.can_fit(runner.vcpus) {
            Ok(())
        } else {
            Err(format!(
                "needs {} vcpus, {:.1} free",
                runner.vcpus,
                node.cpu.free()
            ))
        }
    }
}

pub struct RamCapacityFilter;

impl Filter for RamCapacityFilter {
    fn name(&self) -> &'static str {
        FilterKind::RamCapacity.name()
    }

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict {
        if node.ram.can_fit(runner.memory_bytes()) {
            Ok(())
        } else {
            Err(format!(
                "needs {} bytes of memory, {:.0} free",
                runner.memory_bytes(),
                node.ram.free()
            ))
        }
    }
}

/// Every affinity expression on the runner must hold for the node's labels.
pub struct AffinityFilter;

impl Filter for AffinityFilter {
    fn name(&self) -> &'static str {
        FilterKind::Affinity.name()
    }

    fn filter(&self, runner: &Runner, node: &Node) -> Verdict {
        match runner.affinity.iter().find(|expr| !expr.matches(&node.labels)) {
            None => Ok(()),
            Some(expr) => Err(format!(
                "label {} does not satisfy {:?} {:?}",
                expr.key, expr.operator, expr.values
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::node::BYTES_PER_MB;
    use hangar_core::{AffinityExpression, AffinityOperator, Resource};
    use std::time::Duration;

    fn node() -> Node {
        Node::new(
            "host-1",
            "acme",
            "default",
            Resource::new(4),
            Resource::new(1024 * BYTES_PER_MB),
        )
    }

    fn runner(vcpus: u64, memory_mb: u64) -> Runner {
        Runner::new("job", "acme", "default", vcpus, memory_mb)
    }

    #[test]
    fn test_status_filter() {
        let mut n = node();
        assert!(StatusFilter.filter(&runner(1, 1), &n).is_ok());
        for status in [NodeStatus::Offline, NodeStatus::Unknown, NodeStatus::Cordoned] {
            n.status = status;
            assert!(StatusFilter.filter(&runner(1, 1), &n).is_err());
        }
    }

    #[test]
    fn test_cordon_filter_ignores_status() {
        let mut n = node();
        n.is_cordoned = true;
        assert_eq!(n.status, NodeStatus::Online);
        assert!(CordonFilter.filter(&runner(1, 1), &n).is_err());
    }

    #[test]
    fn test_heartbeat_filter() {
        let filter = HeartbeatFilter::new(Duration::from_secs(60));
        let mut n = node();
        assert!(filter.filter(&runner(1, 1), &n).is_ok());

        n.updated_at = Utc::now() - ChronoDuration::seconds(90);
        assert!(filter.filter(&runner(1, 1), &n).is_err());
    }

    #[test]
    fn test_tenancy_filters() {
        let n = node();
        let mut other_org = runner(1, 1);
        other_org.organisation = "globex".to_string();
        assert!(OrganisationFilter.filter(&other_org, &n).is_err());
        assert!(GroupFilter.filter(&other_org, &n).is_ok());

        let mut other_group = runner(1, 1);
        other_group.group = "gpu".to_string();
        assert!(GroupFilter.filter(&other_group, &n).is_err());
        assert!(OrganisationFilter.filter(&other_group, &n).is_ok());
    }

    #[test]
    fn test_cpu_capacity_with_overcommit() {
        let mut n = node();
        n.cpu = Resource::new(4).with_overcommit(2.0);
        n.cpu.allocated = 6;
        assert!(CpuCapacityFilter.filter(&runner(2, 1), &n).is_ok());
        assert!(CpuCapacityFilter.filter(&runner(3, 1), &n).is_err());
    }

    #[test]
    fn test_ram_capacity_uses_bytes() {
        let mut n = node();
        n.ram.allocated = 512 * BYTES_PER_MB;
        assert!(RamCapacityFilter.filter(&runner(1, 512), &n).is_ok());
        assert!(RamCapacityFilter.filter(&runner(1, 513), &n).is_err());
    }

    #[test]
    fn test_affinity_filter() {
        let n = node().with_label("region", "eu");
        let wants_eu = runner(1, 1).with_affinity(AffinityExpression::new(
            "region",
            AffinityOperator::In,
            &["eu"],
        ));
        let avoids_eu = runner(1, 1).with_affinity(AffinityExpression::new(
            "region",
            AffinityOperator::NotIn,
            &["eu"],
        ));
        let wants_gpu = runner(1, 1).with_affinity(AffinityExpression::new(
            "gpu",
            AffinityOperator::In,
            &["a100"],
        ));

        assert!(AffinityFilter.filter(&wants_eu, &n).is_ok());
        assert!(AffinityFilter.filter(&avoids_eu, &n).is_err());
        assert!(AffinityFilter.filter(&wants_gpu, &n).is_err());
        assert!(AffinityFilter.filter(&runner(1, 1), &n).is_ok());
    }

    #[test]
    fn test_build_filter_names() {
        let config = SchedulerConfig::default();
        for kind in FilterKind::ALL {
            assert_eq!(build_filter(kind, &config).name(), kind.name());
        }
    }
}
