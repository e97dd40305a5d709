//! Node scorers. Scores from every scorer are summed; higher is better.

use hangar_config::{ScorerConfig, ScorerKind};
use hangar_core::Node;
use hangar_core::node::BYTES_PER_GB;

pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, node: &Node) -> f64;
}

pub fn build_scorer(config: &ScorerConfig) -> Box<dyn Scorer> {
    match config.kind {
        ScorerKind::FreeCpu => Box::new(FreeCpuScorer {
            multiplier: config.multiplier,
        }),
        ScorerKind::FreeRam => Box::new(FreeRamScorer {
            multiplier: config.multiplier,
        }),
    }
}

/// Unallocated vCPUs times the multiplier.
pub struct FreeCpuScorer {
    pub multiplier: f64,
}

impl Scorer for FreeCpuScorer {
    fn name(&self) -> &'static str {
        ScorerKind::FreeCpu.name()
    }

    fn score(&self, node: &Node) -> f64 {
        (node.cpu.capacity as f64 - node.cpu.allocated as f64) * self.multiplier
    }
}

/// Unallocated memory in GiB times the multiplier. At equal multipliers a
/// free GiB weighs the same as a free vCPU.
pub struct FreeRamScorer {
    pub multiplier: f64,
}

impl Scorer for FreeRamScorer {
    fn name(&self) -> &'static str {
        ScorerKind::FreeRam.name()
    }

    fn score(&self, node: &Node) -> f64 {
        let free_bytes = node.ram.capacity as f64 - node.ram.allocated as f64;
        free_bytes / BYTES_PER_GB as f64 * self.multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::Resource;
    use hangar_core::node::BYTES_PER_MB;

    fn node(cpu: u64, cpu_used: u64, ram_mb: u64, ram_used_mb: u64) -> Node {
        let mut node = Node::new(
            "host",
            "acme",
            "default",
            Resource::new(cpu),
            Resource::new(ram_mb * BYTES_PER_MB),
        );
        node.cpu.allocated = cpu_used;
        node.ram.allocated = ram_used_mb * BYTES_PER_MB;
        node
    }

    #[test]
    fn test_free_cpu() {
        let scorer = FreeCpuScorer { multiplier: 2.0 };
        assert_eq!(scorer.score(&node(8, 3, 0, 0)), 10.0);
    }

    #[test]
    fn test_free_cpu_goes_negative_when_overcommitted() {
        let scorer = FreeCpuScorer { multiplier: 1.0 };
        assert_eq!(scorer.score(&node(4, 6, 0, 0)), -2.0);
    }

    #[test]
    fn test_free_ram_in_gib() {
        let scorer = FreeRamScorer { multiplier: 0.5 };
        assert_eq!(scorer.score(&node(1, 0, 4096, 1024)), 1.5);
    }

    #[test]
    fn test_default_weights_let_cpu_decide() {
        let cpu = FreeCpuScorer { multiplier: 1.0 };
        let ram = FreeRamScorer { multiplier: 1.0 };
        // Same memory, more free vCPUs: the CPU-rich node must win.
        let busy = node(8, 6, 16 * 1024, 0);
        let idle = node(8, 0, 16 * 1024, 0);
        let total = |n: &Node| cpu.score(n) + ram.score(n);
        assert_eq!(total(&busy), 18.0);
        assert_eq!(total(&idle), 24.0);

        // A few GiB of extra memory doesn't swamp a vCPU gap.
        let roomy = node(8, 6, 20 * 1024, 0);
        assert!(total(&idle) > total(&roomy));
    }

    #[test]
    fn test_zero_multiplier_disables() {
        let scorer = build_scorer(&ScorerConfig {
            kind: ScorerKind::FreeRam,
            multiplier: 0.0,
        });
        assert_eq!(scorer.name(), "free-ram");
        assert_eq!(scorer.score(&node(1, 0, 2048, 0)), 0.0);
    }
}
