//! Mock engine for optimizer and evaluator tests
//!
//! Responds to `run` with a synthetic result computed from the parameters,
//! so search behavior can be exercised without touching storage. The
//! saturation model mirrors a device that scales linearly with workers up
//! to a ceiling.

use super::{Engine, Params, RunResult, TerminationReason};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type ResponseFn = Box<dyn Fn(&Params) -> RunResult + Send + Sync>;

pub struct MockEngine {
    respond: ResponseFn,
    calls: AtomicU64,
}

impl MockEngine {
    /// Mock with an arbitrary response function
    pub fn new(respond: impl Fn(&Params) -> RunResult + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicU64::new(0),
        }
    }

    /// Saturation model: IOPS = min(workers * per_worker, cap)
    pub fn saturating(per_worker: f64, cap: f64) -> Self {
        Self::new(move |params: &Params| {
            let iops = (params.workers as f64 * per_worker).min(cap);
            MockEngine::result_with_iops(iops, params)
        })
    }

    /// Number of times `run` has been invoked
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Plausible full result around a target IOPS figure
    pub fn result_with_iops(iops: f64, params: &Params) -> RunResult {
        let duration = Duration::from_secs(1);
        let total_ios = iops as u64;
        // Latency scales inversely with throughput, queue depth adds wait.
        let base_us = if iops > 0.0 { 1e6 / iops } else { 0.0 };
        let qd = params.queue_depth.max(1) as f64;
        let mean = Duration::from_micros((base_us * qd) as u64);
        RunResult {
            iops,
            throughput: iops * params.block_size as f64,
            mean_latency: mean,
            p50_latency: mean,
            p95_latency: mean * 2,
            p99_latency: mean * 3,
            p999_latency: mean * 5,
            total_ios,
            duration,
            confidence: 0.01,
            termination: TerminationReason::Converged,
        }
    }
}

impl Engine for MockEngine {
    fn run(&self, params: &Params) -> Result<RunResult> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok((self.respond)(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_model() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let mut params = Params::default();
        params.path = "/dev/null".into();

        params.workers = 2;
        assert_eq!(engine.run(&params).unwrap().iops, 2000.0);

        params.workers = 8;
        assert_eq!(engine.run(&params).unwrap().iops, 4000.0);

        assert_eq!(engine.call_count(), 2);
    }
}
