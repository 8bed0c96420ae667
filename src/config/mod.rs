//! Configuration for optimization runs
//!
//! A config names the target, the optimizer, engine settings shared by every
//! evaluation, the search space (one entry per tunable variable), and the
//! objectives that turn a run result into a score. Configs load from YAML
//! and can be written back out for `--write-config`.

use crate::engine::EngineKind;
use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outer search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Coordinate,
    SimulatedAnnealing,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device or file under test
    pub target: PathBuf,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub search: Vec<Variable>,
    #[serde(default)]
    pub objectives: Vec<Objective>,
}

/// Engine settings shared by every evaluation, plus annealing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine_type: EngineKind,
    pub direct: bool,
    /// 0 = all writes, 100 = all reads
    pub read_pct: u8,
    pub rand: bool,
    #[serde(with = "humantime_serde")]
    pub min_runtime: Duration,
    #[serde(with = "humantime_serde")]
    pub max_runtime: Duration,
    pub error_target: f64,

    pub initial_temp: f64,
    pub cooling_rate: f64,
    pub min_temp: f64,
    pub steps_per_temp: u32,
    pub restart_interval: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_type: EngineKind::Sync,
            direct: false,
            read_pct: 100,
            rand: true,
            min_runtime: Duration::from_secs(1),
            max_runtime: Duration::from_secs(5),
            error_target: 0.0,
            initial_temp: 1000.0,
            cooling_rate: 0.95,
            min_temp: 0.01,
            steps_per_temp: 1,
            restart_interval: 0,
        }
    }
}

/// One tunable variable: either an explicit value list or an inclusive range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    #[serde(rename = "variable")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[i64; 2]>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub step: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Variable {
    /// The starting value for coordinate descent: the middle element of the
    /// list, or the range midpoint.
    pub fn midpoint(&self) -> i64 {
        if !self.values.is_empty() {
            return self.values[self.values.len() / 2];
        }
        match self.range {
            Some([lo, hi]) => (lo + hi) / 2,
            None => 0,
        }
    }

    /// The first listed value or the range minimum
    pub fn first_value(&self) -> i64 {
        if !self.values.is_empty() {
            return self.values[0];
        }
        self.range.map(|[lo, _]| lo).unwrap_or(0)
    }

    /// Whether this variable spans more than one candidate value
    pub fn is_sweepable(&self) -> bool {
        if self.values.len() > 1 {
            return true;
        }
        matches!(self.range, Some([lo, hi]) if self.values.is_empty() && hi > lo)
    }
}

/// What an objective does with its metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveType {
    Maximize,
    Minimize,
    Constraint,
}

/// Metric an objective reads from a run result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Iops,
    Throughput,
    P50Latency,
    P95Latency,
    P99Latency,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Iops => write!(f, "iops"),
            Metric::Throughput => write!(f, "throughput"),
            Metric::P50Latency => write!(f, "p50_latency"),
            Metric::P95Latency => write!(f, "p95_latency"),
            Metric::P99Latency => write!(f, "p99_latency"),
        }
    }
}

/// One scoring rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    #[serde(rename = "type")]
    pub kind: ObjectiveType,
    pub metric: Metric,
    /// Constraint bound: a duration string ("10ms"), else seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

impl Config {
    /// Load a YAML config file and apply defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        if cfg.settings.min_runtime == Duration::ZERO {
            cfg.settings.min_runtime = Duration::from_secs(1);
        }
        if cfg.settings.max_runtime == Duration::ZERO {
            cfg.settings.max_runtime = Duration::from_secs(5);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the config back out as YAML
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self).context("failed to serialize configuration")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.as_os_str().is_empty() {
            bail!("configuration must name a target");
        }
        if self.settings.read_pct > 100 {
            bail!("read_pct out of range: {}", self.settings.read_pct);
        }
        for v in &self.search {
            if v.values.is_empty() && v.range.is_none() {
                bail!("search variable '{}' needs values or a range", v.name);
            }
            if let Some([lo, hi]) = v.range {
                if hi < lo {
                    bail!("search variable '{}' has an inverted range", v.name);
                }
            }
        }
        for o in &self.objectives {
            if o.kind == ObjectiveType::Constraint && o.limit.is_none() {
                bail!("constraint on {} needs a limit", o.metric);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
target: /dev/nvme0n1
optimizer: simulated_annealing
settings:
  engine_type: uring
  direct: true
  read_pct: 70
  rand: true
  min_runtime: 2s
  max_runtime: 10s
  error_target: 0.05
  initial_temp: 500
  cooling_rate: 0.9
search:
  - variable: workers
    range: [1, 32]
    step: 2
  - variable: block_size
    values: [4096, 8192, 16384]
objectives:
  - type: maximize
    metric: iops
  - type: constraint
    metric: p99_latency
    limit: 10ms
"#;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("jolt.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_config(&dir, FULL_CONFIG)).unwrap();

        assert_eq!(cfg.target, PathBuf::from("/dev/nvme0n1"));
        assert_eq!(cfg.optimizer, OptimizerKind::SimulatedAnnealing);
        assert_eq!(cfg.settings.engine_type, EngineKind::Uring);
        assert!(cfg.settings.direct);
        assert_eq!(cfg.settings.read_pct, 70);
        assert_eq!(cfg.settings.min_runtime, Duration::from_secs(2));
        assert_eq!(cfg.settings.initial_temp, 500.0);
        assert_eq!(cfg.settings.cooling_rate, 0.9);
        // Untouched annealing knobs keep their defaults.
        assert_eq!(cfg.settings.min_temp, 0.01);
        assert_eq!(cfg.settings.steps_per_temp, 1);

        assert_eq!(cfg.search.len(), 2);
        assert_eq!(cfg.search[0].name, "workers");
        assert_eq!(cfg.search[0].range, Some([1, 32]));
        assert_eq!(cfg.search[0].step, 2);
        assert_eq!(cfg.search[1].values, vec![4096, 8192, 16384]);

        assert_eq!(cfg.objectives.len(), 2);
        assert_eq!(cfg.objectives[1].kind, ObjectiveType::Constraint);
        assert_eq!(cfg.objectives[1].metric, Metric::P99Latency);
        assert_eq!(cfg.objectives[1].limit.as_deref(), Some("10ms"));
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_config(&dir, "target: /tmp/test.dat\n")).unwrap();

        assert_eq!(cfg.optimizer, OptimizerKind::Coordinate);
        assert_eq!(cfg.settings.min_runtime, Duration::from_secs(1));
        assert_eq!(cfg.settings.max_runtime, Duration::from_secs(5));
        assert_eq!(cfg.settings.engine_type, EngineKind::Sync);
        assert_eq!(cfg.settings.read_pct, 100);
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(&write_config(&dir, "target: [unclosed")).is_err());
    }

    #[test]
    fn test_constraint_without_limit_rejected() {
        let dir = TempDir::new().unwrap();
        let yaml = "target: /tmp/x\nobjectives:\n  - type: constraint\n    metric: p99_latency\n";
        assert!(Config::load(&write_config(&dir, yaml)).is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_config(&dir, FULL_CONFIG)).unwrap();

        let out = dir.path().join("out.yaml");
        cfg.save(&out).unwrap();
        let back = Config::load(&out).unwrap();

        assert_eq!(back.target, cfg.target);
        assert_eq!(back.optimizer, cfg.optimizer);
        assert_eq!(back.search.len(), cfg.search.len());
        assert_eq!(back.objectives.len(), cfg.objectives.len());
        assert_eq!(back.settings.min_runtime, cfg.settings.min_runtime);
    }

    #[test]
    fn test_variable_midpoint() {
        let list = Variable {
            name: "block_size".into(),
            values: vec![4096, 8192, 16384],
            range: None,
            step: 0,
        };
        assert_eq!(list.midpoint(), 8192);
        assert_eq!(list.first_value(), 4096);
        assert!(list.is_sweepable());

        let range = Variable {
            name: "workers".into(),
            values: vec![],
            range: Some([1, 9]),
            step: 0,
        };
        assert_eq!(range.midpoint(), 5);
        assert_eq!(range.first_value(), 1);
        assert!(range.is_sweepable());

        let pinned = Variable {
            name: "queue_depth".into(),
            values: vec![8],
            range: None,
            step: 0,
        };
        assert!(!pinned.is_sweepable());
    }
}
