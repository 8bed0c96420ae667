//! Parameter search: states, evaluation, and scoring
//!
//! A [`State`] maps tunable variable names to integer values. The
//! [`Evaluator`] turns a state into engine [`Params`] (three well-known
//! keys; everything else rides along untouched), runs the engine, merges
//! repeat evaluations of the same state, scores the result against the
//! configured objectives, and keeps the append-only history that becomes
//! the JSON report.

pub mod annealing;
pub mod coordinate;

use crate::config::{Config, Metric, ObjectiveType};
use crate::engine::{Engine, Params, RunResult};
use crate::util::time::{format_duration, parse_limit};
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A specific configuration of search variables
///
/// Kept as a dynamic map so new tunables can be introduced without schema
/// churn; the ordered map also gives cache keys a canonical ordering for
/// free.
pub type State = BTreeMap<String, i64>;

/// Scaled score assigned to any state that fails a hard constraint
pub const CONSTRAINT_PENALTY: f64 = -1000.0;

/// One evaluated state, as recorded in the report file
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub state: State,
    pub result: RunResult,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Runs engine evaluations and computes normalized scores
pub struct Evaluator {
    engine: Box<dyn Engine>,
    cfg: Config,
    /// Baseline |raw score| of the first successful evaluation; all scores
    /// scale to ~1000 against it
    initial_score: f64,
    /// Merged results keyed by the canonical encoding of the full state
    cache: HashMap<String, RunResult>,
    history: Vec<HistoryEntry>,
}

/// Canonical cache key covering every key present in the state
pub fn cache_key(state: &State) -> String {
    let parts: Vec<String> = state.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    parts.join(";")
}

impl Evaluator {
    pub fn new(engine: Box<dyn Engine>, cfg: Config) -> Self {
        Self {
            engine,
            cfg,
            initial_score: 0.0,
            cache: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Run the engine at `state` and return (result, scaled score, failure
    /// reason). Repeat evaluations of an identical state merge with the
    /// cached result so noisy points accumulate observation time.
    pub fn evaluate(&mut self, state: &State) -> Result<(RunResult, f64, Option<String>)> {
        let params = self.params_for(state);
        let key = cache_key(state);

        let fresh = self.engine.run(&params)?;
        let result = match self.cache.remove(&key) {
            Some(cached) => merge_results(&cached, &fresh, params.block_size),
            None => fresh,
        };
        self.cache.insert(key, result.clone());

        let (raw, reason) = self.calculate_score(&result);
        if self.initial_score <= 1.0 && reason.is_none() {
            self.initial_score = raw.abs().max(1.0);
        }
        let score = self.scale_score(raw, reason.as_deref());

        self.history.push(HistoryEntry {
            state: state.clone(),
            result: result.clone(),
            score,
            reason: reason.clone(),
        });

        Ok((result, score, reason))
    }

    /// Build engine params from settings plus the well-known state keys
    fn params_for(&self, state: &State) -> Params {
        let mut params = Params {
            engine: self.cfg.settings.engine_type,
            path: self.cfg.target.clone(),
            direct: self.cfg.settings.direct,
            read_pct: self.cfg.settings.read_pct,
            random: self.cfg.settings.rand,
            min_runtime: self.cfg.settings.min_runtime,
            max_runtime: self.cfg.settings.max_runtime,
            error_target: self.cfg.settings.error_target,
            block_size: 4096,
            workers: 1,
            queue_depth: 1,
            progress: None,
            trace: None,
        };
        if let Some(&v) = state.get("block_size") {
            params.block_size = v.max(0) as usize;
        }
        if let Some(&v) = state.get("workers") {
            params.workers = v.max(0) as usize;
        }
        if let Some(&v) = state.get("queue_depth") {
            params.queue_depth = v.max(0) as usize;
        }
        params
    }

    fn scale_score(&self, raw: f64, reason: Option<&str>) -> f64 {
        if reason.is_some() {
            return CONSTRAINT_PENALTY;
        }
        let baseline = if self.initial_score < 1.0 {
            1.0
        } else {
            self.initial_score
        };
        (raw / baseline) * 1000.0
    }

    /// Raw objective score, or the constraint that failed
    fn calculate_score(&self, result: &RunResult) -> (f64, Option<String>) {
        // Constraint phase: any violated hard limit short-circuits scoring.
        for objective in &self.cfg.objectives {
            if objective.kind != ObjectiveType::Constraint {
                continue;
            }
            let limit = match &objective.limit {
                Some(limit) => limit,
                None => continue,
            };
            let actual = match objective.metric {
                Metric::P50Latency => result.p50_latency,
                Metric::P95Latency => result.p95_latency,
                Metric::P99Latency => result.p99_latency,
                // Rate metrics have no duration bound semantics.
                Metric::Iops | Metric::Throughput => continue,
            };
            if actual > parse_limit(limit) {
                return (
                    0.0,
                    Some(format!(
                        "Constraint Failed: {} ({} > {})",
                        objective.metric,
                        format_duration(actual),
                        limit
                    )),
                );
            }
        }

        // Scoring phase: IOPS as-is, throughput in MB/s, latencies as
        // negative milliseconds so that larger is always better.
        let mut score = 0.0;
        for objective in &self.cfg.objectives {
            let value = match objective.metric {
                Metric::Iops => result.iops,
                Metric::Throughput => result.throughput / 1024.0 / 1024.0,
                Metric::P50Latency => -(result.p50_latency.as_secs_f64() * 1000.0),
                Metric::P95Latency => -(result.p95_latency.as_secs_f64() * 1000.0),
                Metric::P99Latency => -(result.p99_latency.as_secs_f64() * 1000.0),
            };
            match objective.kind {
                ObjectiveType::Maximize => score += value,
                ObjectiveType::Minimize => score -= value,
                ObjectiveType::Constraint => {}
            }
        }
        (score, None)
    }

    /// Metric summary line driven by the configured objectives
    pub fn format_metrics(&self, result: &RunResult) -> String {
        let mut parts: Vec<String> = Vec::new();
        for objective in &self.cfg.objectives {
            let part = match objective.metric {
                Metric::Iops => format!("IOPS: {:.0}", result.iops),
                Metric::Throughput => {
                    format!("BW: {:.2} MB/s", result.throughput / 1024.0 / 1024.0)
                }
                Metric::P50Latency => format!("P50: {}", format_duration(result.p50_latency)),
                Metric::P95Latency => format!("P95: {}", format_duration(result.p95_latency)),
                Metric::P99Latency => format!("P99: {}", format_duration(result.p99_latency)),
            };
            if !parts.contains(&part) {
                parts.push(part);
            }
        }
        if parts.is_empty() {
            return format!("IOPS: {:.0}", result.iops);
        }
        parts.join(", ")
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

/// Merge a fresh run into the cached result for the same state
///
/// Counts and durations add; IOPS and throughput recompute from the totals;
/// percentiles combine by operation-count weighting (an acknowledged
/// approximation); confidence averages.
fn merge_results(cached: &RunResult, fresh: &RunResult, block_size: usize) -> RunResult {
    let total_ios = cached.total_ios + fresh.total_ios;
    let duration = cached.duration + fresh.duration;
    let secs = duration.as_secs_f64();

    let weigh = |a: Duration, b: Duration| -> Duration {
        if total_ios == 0 {
            return Duration::ZERO;
        }
        let weighted = (a.as_nanos() as f64 * cached.total_ios as f64
            + b.as_nanos() as f64 * fresh.total_ios as f64)
            / total_ios as f64;
        Duration::from_nanos(weighted as u64)
    };

    RunResult {
        iops: if secs > 0.0 { total_ios as f64 / secs } else { 0.0 },
        throughput: if secs > 0.0 {
            (total_ios * block_size as u64) as f64 / secs
        } else {
            0.0
        },
        mean_latency: weigh(cached.mean_latency, fresh.mean_latency),
        p50_latency: weigh(cached.p50_latency, fresh.p50_latency),
        p95_latency: weigh(cached.p95_latency, fresh.p95_latency),
        p99_latency: weigh(cached.p99_latency, fresh.p99_latency),
        p999_latency: weigh(cached.p999_latency, fresh.p999_latency),
        total_ios,
        duration,
        confidence: (cached.confidence + fresh.confidence) / 2.0,
        termination: fresh.termination,
    }
}
