//! The filter and scorer set a scheduling pass runs.

use hangar_config::SchedulerConfig;
use hangar_core::{Node, Runner};
use std::collections::BTreeMap;

use crate::filter::{Filter, build_filter};
use crate::score::{Scorer, build_scorer};

/// Outcome of filtering a node list for one runner.
#[derive(Debug, Default)]
pub struct Feasibility {
    pub feasible: Vec<Node>,
    /// Rejected node count per filter name.
    pub rejections: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f64,
}

pub struct SchedulingProfile {
    filters: Vec<Box<dyn Filter>>,
    scorers: Vec<Box<dyn Scorer>>,
}

impl SchedulingProfile {
    pub fn new(filters: Vec<Box<dyn Filter>>, scorers: Vec<Box<dyn Scorer>>) -> Self {
        Self { filters, scorers }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            filters: config
                .filters
                .iter()
                .map(|kind| build_filter(*kind, config))
                .collect(),
            scorers: config.scorers.iter().map(build_scorer).collect(),
        }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn scorer_names(&self) -> Vec<&'static str> {
        self.scorers.iter().map(|s| s.name()).collect()
    }

    /// Run the filters in order, stopping at the first rejection.
    pub fn check(&self, runner: &Runner, node: &Node) -> Result<(), (&'static str, String)> {
        for filter in &self.filters {
            filter
                .filter(runner, node)
                .map_err(|reason| (filter.name(), reason))?;
        }
        Ok(())
    }

    pub fn feasible_nodes(&self, runner: &Runner, nodes: Vec<Node>) -> Feasibility {
        let mut result = Feasibility::default();
        for node in nodes {
            match self.check(runner, &node) {
                Ok(()) => result.feasible.push(node),
                Err((filter, _)) => *result.rejections.entry(filter).or_default() += 1,
            }
        }
        result
    }

    /// Sum of all scorers for one node.
    pub fn score(&self, node: &Node) -> f64 {
        self.scorers.iter().map(|s| s.score(node)).sum()
    }

    /// Highest aggregate score wins; equal scores go to the lowest node id.
    /// Nodes whose score is not a finite number are skipped.
    pub fn best_node(&self, feasible: Vec<Node>) -> Option<ScoredNode> {
        let mut best: Option<ScoredNode> = None;
        for node in feasible {
            let score = self.score(&node);
            if !score.is_finite() {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    score > current.score || (score == current.score && node.id < current.node.id)
                }
            };
            if better {
                best = Some(ScoredNode { node, score });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::FreeCpuScorer;
    use hangar_config::FilterKind;
    use hangar_core::node::BYTES_PER_MB;
    use hangar_core::{NodeStatus, Resource};

    fn node(name: &str, cpu: u64) -> Node {
        Node::new(
            name,
            "acme",
            "default",
            Resource::new(cpu),
            Resource::new(4096 * BYTES_PER_MB),
        )
    }

    fn runner() -> Runner {
        Runner::new("job", "acme", "default", 1, 256)
    }

    struct NanScorer;

    impl Scorer for NanScorer {
        fn name(&self) -> &'static str {
            "nan"
        }

        fn score(&self, _node: &Node) -> f64 {
            f64::NAN
        }
    }

    #[test]
    fn test_from_config_keeps_order() {
        let mut config = SchedulerConfig::default();
        config.filters = vec![FilterKind::Affinity, FilterKind::Status];
        let profile = SchedulingProfile::from_config(&config);
        assert_eq!(profile.filter_names(), vec!["affinity", "status"]);
        assert_eq!(profile.scorer_names(), vec!["free-cpu", "free-ram"]);
    }

    #[test]
    fn test_feasible_nodes_tallies_rejections() {
        let profile = SchedulingProfile::from_config(&SchedulerConfig::default());
        let good = node("good", 4);
        let mut offline = node("offline", 4);
        offline.status = NodeStatus::Offline;
        let mut full = node("full", 4);
        full.cpu.allocated = 4;

        let result = profile.feasible_nodes(&runner(), vec![good.clone(), offline, full]);
        assert_eq!(result.feasible.len(), 1);
        assert_eq!(result.feasible[0].id, good.id);
        assert_eq!(result.rejections.get("status"), Some(&1));
        assert_eq!(result.rejections.get("cpu-capacity"), Some(&1));
    }

    #[test]
    fn test_check_reports_first_failing_filter() {
        let profile = SchedulingProfile::from_config(&SchedulerConfig::default());
        let mut n = node("n", 4);
        n.status = NodeStatus::Offline;
        n.is_cordoned = true;
        let (filter, _) = profile.check(&runner(), &n).unwrap_err();
        assert_eq!(filter, "status");
    }

    #[test]
    fn test_best_node_prefers_most_free() {
        let profile = SchedulingProfile::new(
            Vec::new(),
            vec![Box::new(FreeCpuScorer { multiplier: 1.0 })],
        );
        let small = node("small", 2);
        let big = node("big", 8);

        let best = profile.best_node(vec![small, big.clone()]).unwrap();
        assert_eq!(best.node.id, big.id);
        assert_eq!(best.score, 8.0);
    }

    #[test]
    fn test_best_node_tie_goes_to_lowest_id() {
        let profile = SchedulingProfile::from_config(&SchedulerConfig::default());
        let a = node("a", 4);
        let b = node("b", 4);
        let expected = a.id.min(b.id);

        assert_eq!(
            profile.best_node(vec![a.clone(), b.clone()]).unwrap().node.id,
            expected
        );
        assert_eq!(profile.best_node(vec![b, a]).unwrap().node.id, expected);
    }

    #[test]
    fn test_best_node_skips_unscorable() {
        let profile = SchedulingProfile::new(Vec::new(), vec![Box::new(NanScorer)]);
        assert!(profile.best_node(vec![node("n", 4)]).is_none());
        assert!(profile.best_node(Vec::new()).is_none());
    }
}
