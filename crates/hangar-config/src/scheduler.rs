//! Scheduler configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// A feasibility filter the scheduler can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    Status,
    Cordon,
    Heartbeat,
    Organisation,
    Group,
    CpuCapacity,
    RamCapacity,
    Affinity,
}

impl FilterKind {
    /// Every filter, cheapest first.
    pub const ALL: [FilterKind; 8] = [
        FilterKind::Status,
        FilterKind::Cordon,
        FilterKind::Heartbeat,
        FilterKind::Organisation,
        FilterKind::Group,
        FilterKind::CpuCapacity,
        FilterKind::RamCapacity,
        FilterKind::Affinity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Status => "status",
            FilterKind::Cordon => "cordon",
            FilterKind::Heartbeat => "heartbeat",
            FilterKind::Organisation => "organisation",
            FilterKind::Group => "group",
            FilterKind::CpuCapacity => "cpu-capacity",
            FilterKind::RamCapacity => "ram-capacity",
            FilterKind::Affinity => "affinity",
        }
    }
}

impl std::str::FromStr for FilterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        FilterKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "filters".to_string(),
                message: format!("unknown filter: {}", s),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerKind {
    FreeCpu,
    FreeRam,
}

impl ScorerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScorerKind::FreeCpu => "free-cpu",
            ScorerKind::FreeRam => "free-ram",
        }
    }
}

impl std::str::FromStr for ScorerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "free-cpu" => Ok(ScorerKind::FreeCpu),
            "free-ram" => Ok(ScorerKind::FreeRam),
            _ => Err(ConfigError::InvalidValue {
                field: "scorer".to_string(),
                message: format!("unknown scorer: {}", s),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub kind: ScorerKind,
    pub multiplier: f64,
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Nodes whose last heartbeat is older than this are skipped.
    pub heartbeat_timeout: Duration,
    /// Pause after a failed assignment transaction.
    pub retry_backoff: Duration,
    /// Filters in evaluation order.
    pub filters: Vec<FilterKind>,
    pub scorers: Vec<ScorerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            filters: FilterKind::ALL.to_vec(),
            scorers: vec![
                ScorerConfig {
                    kind: ScorerKind::FreeCpu,
                    multiplier: 1.0,
                },
                ScorerConfig {
                    kind: ScorerKind::FreeRam,
                    multiplier: 1.0,
                },
            ],
        }
    }
}

/// Read and parse a scheduler configuration file.
pub fn load_scheduler_config(path: impl AsRef<Path>) -> ConfigResult<SchedulerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_scheduler_config(&text)
}

/// Parse scheduler configuration from KDL text.
///
/// Anything not mentioned keeps its default; a `filters` node or any
/// `scorer` node replaces the whole default list.
pub fn parse_scheduler_config(kdl: &str) -> ConfigResult<SchedulerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SchedulerConfig::default();

    let Some(scheduler) = doc.nodes().iter().find(|n| n.name().value() == "scheduler") else {
        return Ok(config);
    };
    let Some(children) = scheduler.children() else {
        return Ok(config);
    };

    let mut scorers = Vec::new();
    for child in children.nodes() {
        match child.name().value() {
            "heartbeat-timeout-secs" => {
                let secs = get_first_u64_arg(child, "heartbeat-timeout-secs")?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "heartbeat-timeout-secs".to_string(),
                        message: "must be greater than zero".to_string(),
                    });
                }
                config.heartbeat_timeout = Duration::from_secs(secs);
            }
            "retry-backoff-ms" => {
                let ms = get_first_u64_arg(child, "retry-backoff-ms")?;
                config.retry_backoff = Duration::from_millis(ms);
            }
            "filters" => {
                config.filters = parse_filters(child)?;
            }
            "scorer" => {
                let scorer = parse_scorer(child)?;
                if scorers.iter().any(|s: &ScorerConfig| s.kind == scorer.kind) {
                    return Err(ConfigError::Duplicate(format!(
                        "scorer '{}'",
                        scorer.kind.name()
                    )));
                }
                scorers.push(scorer);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if !scorers.is_empty() {
        config.scorers = scorers;
    }

    Ok(config)
}

fn parse_filters(node: &KdlNode) -> ConfigResult<Vec<FilterKind>> {
    let mut filters = Vec::new();
    for name in get_all_string_args(node) {
        let kind: FilterKind = name.parse()?;
        if filters.contains(&kind) {
            return Err(ConfigError::Duplicate(format!("filter '{}'", name)));
        }
        filters.push(kind);
    }
    Ok(filters)
}

fn parse_scorer(node: &KdlNode) -> ConfigResult<ScorerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("scorer name".to_string()))?;
    let kind: ScorerKind = name.parse()?;

    let multiplier = match node.get("multiplier") {
        None => 1.0,
        Some(value) => value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: format!("scorer '{}' multiplier", name),
                message: "expected a number".to_string(),
            })?,
    };

    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(ConfigError::InvalidValue {
            field: format!("scorer '{}' multiplier", name),
            message: format!("must be a non-negative number, got {}", multiplier),
        });
    }

    Ok(ScorerConfig { kind, multiplier })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?
        .value();

    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a non-negative integer, got {}", value),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_scheduler_config("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.filters.len(), 8);
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            scheduler {
                heartbeat-timeout-secs 30
                retry-backoff-ms 250
                filters "status" "cpu-capacity" "affinity"
                scorer "free-cpu" multiplier=2.5
                scorer "free-ram" multiplier=0
            }
        "#;

        let config = parse_scheduler_config(kdl).unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(
            config.filters,
            vec![
                FilterKind::Status,
                FilterKind::CpuCapacity,
                FilterKind::Affinity
            ]
        );
        assert_eq!(config.scorers.len(), 2);
        assert_eq!(config.scorers[0].kind, ScorerKind::FreeCpu);
        assert_eq!(config.scorers[0].multiplier, 2.5);
        assert_eq!(config.scorers[1].multiplier, 0.0);
    }

    #[test]
    fn test_scorer_without_multiplier_defaults_to_one() {
        let kdl = r#"
            scheduler {
                scorer "free-ram"
            }
        "#;

        let config = parse_scheduler_config(kdl).unwrap();
        assert_eq!(
            config.scorers,
            vec![ScorerConfig {
                kind: ScorerKind::FreeRam,
                multiplier: 1.0
            }]
        );
    }

    #[test]
    fn test_unknown_filter() {
        let kdl = r#"
            scheduler {
                filters "status" "gpu"
            }
        "#;

        let result = parse_scheduler_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_duplicate_filter() {
        let kdl = r#"
            scheduler {
                filters "status" "status"
            }
        "#;

        let result = parse_scheduler_config(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_duplicate_scorer() {
        let kdl = r#"
            scheduler {
                scorer "free-cpu"
                scorer "free-cpu" multiplier=3.0
            }
        "#;

        let result = parse_scheduler_config(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_negative_multiplier() {
        let kdl = r#"
            scheduler {
                scorer "free-cpu" multiplier=-1.0
            }
        "#;

        let result = parse_scheduler_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_zero_heartbeat_timeout() {
        let kdl = r#"
            scheduler {
                heartbeat-timeout-secs 0
            }
        "#;

        let result = parse_scheduler_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_filter_names_round_trip() {
        for kind in FilterKind::ALL {
            assert_eq!(kind.name().parse::<FilterKind>().unwrap(), kind);
        }
    }
}
