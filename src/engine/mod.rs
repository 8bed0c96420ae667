//! I/O load generation engines
//!
//! An engine executes a single workload point described by [`Params`] and
//! returns a [`RunResult`]. Three in-process drivers share one skeleton:
//! validate the parameters, normalize workers against the global queue
//! depth, spawn one worker thread per logical worker, and run a 100 ms
//! monitor that feeds the rate sampler and decides when to stop (adaptive
//! convergence on relative standard error, or the max-runtime ceiling).
//!
//! # Drivers
//!
//! - **sync**: blocking pread/pwrite, one token-gated operation per worker
//! - **uring**: per-worker io_uring rings with slot-indexed buffers
//! - **libaio**: per-worker Linux AIO contexts via raw syscalls
//! - **fio**: shells out to an external fio binary (job file in, JSON out)
//!
//! Callers depend only on the single capability `run(Params) -> RunResult`;
//! the engine kind is a closed set.

use crate::stats::{LatencyHistogram, RateSampler};
use crate::Result;
use anyhow::bail;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod mock;
pub mod sync;
pub mod token;

#[cfg(feature = "io_uring")]
pub mod uring;

#[cfg(target_os = "linux")]
pub mod libaio;

pub mod fio;

/// Monitor cadence. Not user-tunable: the convergence test needs at least
/// six samples, which pins the quantum.
pub const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Minimum number of rate samples before convergence may fire.
const MIN_CONVERGENCE_SAMPLES: usize = 6;

/// Spans accumulated per worker before a trace batch is emitted.
pub(crate) const TRACE_BATCH_SIZE: usize = 1000;

/// Sentinel frontier: the worker promises no further spans (drain).
pub const FRONTIER_DRAINED: u64 = u64::MAX;

/// Engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Blocking pread/pwrite syscalls
    Sync,
    /// io_uring submission rings
    Uring,
    /// Linux native AIO (io_submit/io_getevents)
    Libaio,
    /// External fio binary
    Fio,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Sync => write!(f, "sync"),
            EngineKind::Uring => write!(f, "uring"),
            EngineKind::Libaio => write!(f, "libaio"),
            EngineKind::Fio => write!(f, "fio"),
        }
    }
}

/// Why a run finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The relative standard error dropped below the target
    Converged,
    /// The maximum runtime was reached
    Timeout,
    /// The run ended on a failure
    Error,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Converged => write!(f, "Converged"),
            TerminationReason::Timeout => write!(f, "Timeout"),
            TerminationReason::Error => write!(f, "Error"),
        }
    }
}

/// One completed I/O on the run's monotonic clock (nanoseconds since the
/// engine epoch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start_ns: u64,
    pub end_ns: u64,
}

/// A batch of completion spans from one worker
///
/// `min_start_ns` is a frontier promise: this worker will not report any
/// future span with a start time below it. [`FRONTIER_DRAINED`] means the
/// worker is done.
#[derive(Debug, Clone)]
pub struct TraceMsg {
    pub worker_id: usize,
    pub spans: Vec<Span>,
    pub min_start_ns: u64,
}

/// Trace sink handed to workers
pub type TraceSender = crossbeam_channel::Sender<TraceMsg>;

/// Intermediate status surfaced to progress callbacks every monitor tick
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub elapsed: Duration,
    /// Trailing-window instantaneous IOPS
    pub iops: f64,
    /// Relative standard error over all samples so far
    pub relative_error: f64,
    pub total_ios: u64,
}

/// Callback invoked by the monitor with intermediate status
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Parameters for a single workload point
#[derive(Clone, Serialize, Deserialize)]
pub struct Params {
    pub engine: EngineKind,
    /// Target device or file
    pub path: PathBuf,
    /// Size of each I/O in bytes
    pub block_size: usize,
    /// Bypass the page cache with O_DIRECT
    pub direct: bool,
    /// Percentage of operations that are reads (0-100)
    pub read_pct: u8,
    /// Random offsets (sequential otherwise)
    pub random: bool,
    /// Number of concurrent workers
    pub workers: usize,
    /// Global queue depth across all workers; 0 defaults to the worker count
    pub queue_depth: usize,
    #[serde(with = "humantime_serde")]
    pub min_runtime: Duration,
    #[serde(with = "humantime_serde")]
    pub max_runtime: Duration,
    /// Target relative standard error (e.g. 0.05); 0 disables convergence
    pub error_target: f64,

    #[serde(skip)]
    pub progress: Option<ProgressFn>,
    #[serde(skip)]
    pub trace: Option<TraceSender>,
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Params")
            .field("engine", &self.engine)
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("direct", &self.direct)
            .field("read_pct", &self.read_pct)
            .field("random", &self.random)
            .field("workers", &self.workers)
            .field("queue_depth", &self.queue_depth)
            .field("min_runtime", &self.min_runtime)
            .field("max_runtime", &self.max_runtime)
            .field("error_target", &self.error_target)
            .field("progress", &self.progress.is_some())
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            engine: EngineKind::Sync,
            path: PathBuf::new(),
            block_size: 4096,
            direct: false,
            read_pct: 100,
            random: true,
            workers: 1,
            queue_depth: 0,
            min_runtime: Duration::from_secs(1),
            max_runtime: Duration::from_secs(5),
            error_target: 0.05,
            progress: None,
            trace: None,
        }
    }
}

impl Params {
    /// Fail fast on parameters no driver can execute
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("invalid block size: 0");
        }
        if self.path.as_os_str().is_empty() {
            bail!("target path is required");
        }
        if self.read_pct > 100 {
            bail!("read percentage out of range: {}", self.read_pct);
        }
        Ok(())
    }

    /// Normalized (workers, global queue depth)
    ///
    /// QD defaults to the worker count when unset; workers are capped at QD
    /// since a worker with zero queue slots cannot make progress.
    pub fn normalized_concurrency(&self) -> (usize, usize) {
        let mut workers = self.workers.max(1);
        let qd = if self.queue_depth == 0 {
            workers
        } else {
            self.queue_depth
        };
        if workers > qd {
            workers = qd;
        }
        (workers, qd)
    }

    /// Worker count after normalization (used by trace consumers that need
    /// to know how many workers will report)
    pub fn effective_workers(&self) -> usize {
        self.normalized_concurrency().0
    }
}

/// Split a global queue depth across workers as evenly as possible; the
/// first `qd % workers` workers receive one extra slot.
pub(crate) fn partition_queue_depth(workers: usize, qd: usize) -> Vec<usize> {
    let base = qd / workers;
    let remainder = qd % workers;
    (0..workers)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Metrics from one completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub iops: f64,
    /// Bytes per second
    pub throughput: f64,
    #[serde(with = "humantime_serde")]
    pub mean_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p50_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p999_latency: Duration,
    pub total_ios: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Achieved relative standard error (lower is better)
    pub confidence: f64,
    pub termination: TerminationReason,
}

/// Capability every engine provides
pub trait Engine: Send + Sync {
    fn run(&self, params: &Params) -> Result<RunResult>;
}

/// Construct an engine for the given kind
pub fn create(kind: EngineKind) -> Result<Box<dyn Engine>> {
    match kind {
        EngineKind::Sync => Ok(Box::new(sync::SyncEngine::new())),

        #[cfg(feature = "io_uring")]
        EngineKind::Uring => Ok(Box::new(uring::UringEngine::new())),
        #[cfg(not(feature = "io_uring"))]
        EngineKind::Uring => bail!("uring engine not available (io_uring feature disabled)"),

        #[cfg(target_os = "linux")]
        EngineKind::Libaio => Ok(Box::new(libaio::LibaioEngine::new())),
        #[cfg(not(target_os = "linux"))]
        EngineKind::Libaio => bail!("libaio engine only available on Linux"),

        EngineKind::Fio => Ok(Box::new(fio::FioEngine::new())),
    }
}

/// State shared between the monitor and all workers of one run
pub(crate) struct Shared {
    /// Cooperative shutdown flag, set exactly once by the monitor
    pub done: Arc<AtomicBool>,
    /// Completed-operation counter, relaxed: only the rate estimate reads it
    pub ops: Arc<AtomicU64>,
    /// Run start; spans and timestamps are relative to this instant
    pub epoch: Instant,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            ops: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
        }
    }
}

/// Per-worker run products, handed back through the join
pub(crate) struct WorkerOutcome {
    pub io_count: u64,
    pub latency: LatencyHistogram,
    pub err: Option<anyhow::Error>,
}

/// Drive a spawned worker set to completion
///
/// Runs the monitor loop on the calling thread, signals `done` once a
/// termination condition fires, joins every worker, and aggregates their
/// outcomes. A worker I/O failure is fatal: the first captured error is
/// returned after all workers have drained.
pub(crate) fn run_to_completion(
    params: &Params,
    shared: &Shared,
    handles: Vec<JoinHandle<WorkerOutcome>>,
) -> Result<RunResult> {
    let (reason, relative_error) = monitor(params, shared);
    shared.done.store(true, Ordering::Release);

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => bail!("worker thread panicked"),
        }
    }

    let duration = shared.epoch.elapsed();
    aggregate(params, outcomes, duration, relative_error, reason)
}

/// Monitor loop: sample the ops counter every tick, emit progress, and
/// decide when the run is over.
fn monitor(params: &Params, shared: &Shared) -> (TerminationReason, f64) {
    let mut sampler = RateSampler::new();
    let mut last_ops = 0u64;
    let mut last_tick = shared.epoch;

    loop {
        std::thread::sleep(MONITOR_TICK);

        let now = Instant::now();
        let elapsed = now.duration_since(shared.epoch);
        let current_ops = shared.ops.load(Ordering::Relaxed);
        let delta_secs = now.duration_since(last_tick).as_secs_f64();
        if delta_secs > 0.0 {
            sampler.push((current_ops - last_ops) as f64 / delta_secs);
        }
        last_ops = current_ops;
        last_tick = now;

        let mean = sampler.mean();
        let relative_error = sampler.relative_error();

        if let Some(progress) = &params.progress {
            (**progress)(Progress {
                elapsed,
                iops: sampler.instantaneous(),
                relative_error,
                total_ios: current_ops,
            });
        }

        if elapsed >= params.min_runtime
            && sampler.len() >= MIN_CONVERGENCE_SAMPLES
            && mean > 0.0
            && params.error_target > 0.0
            && relative_error <= params.error_target
        {
            return (TerminationReason::Converged, relative_error);
        }

        if params.max_runtime > Duration::ZERO && elapsed >= params.max_runtime {
            return (TerminationReason::Timeout, relative_error);
        }
    }
}

fn aggregate(
    params: &Params,
    outcomes: Vec<WorkerOutcome>,
    duration: Duration,
    relative_error: f64,
    reason: TerminationReason,
) -> Result<RunResult> {
    let mut first_err = None;
    let mut total_ios = 0u64;
    let mut latency = LatencyHistogram::new();

    for outcome in outcomes {
        if let Some(err) = outcome.err {
            if first_err.is_none() {
                first_err = Some(err);
            }
            continue;
        }
        total_ios += outcome.io_count;
        latency.merge(&outcome.latency)?;
    }

    if let Some(err) = first_err {
        return Err(err.context("worker failed"));
    }

    let secs = duration.as_secs_f64();
    let iops = if secs > 0.0 { total_ios as f64 / secs } else { 0.0 };
    let throughput = if secs > 0.0 {
        (total_ios * params.block_size as u64) as f64 / secs
    } else {
        0.0
    };

    Ok(RunResult {
        iops,
        throughput,
        mean_latency: Duration::from_micros(latency.mean() as u64),
        p50_latency: latency.duration_at_quantile(0.50),
        p95_latency: latency.duration_at_quantile(0.95),
        p99_latency: latency.duration_at_quantile(0.99),
        p999_latency: latency.duration_at_quantile(0.999),
        total_ios,
        duration,
        confidence: relative_error,
        termination: reason,
    })
}

/// Per-worker span batching toward the trace sink
///
/// Spans accumulate until [`TRACE_BATCH_SIZE`], then flush with the caller's
/// current in-flight frontier. The final flush promises
/// [`FRONTIER_DRAINED`].
pub(crate) struct TraceBuffer {
    sink: Option<TraceSender>,
    worker_id: usize,
    spans: Vec<Span>,
}

impl TraceBuffer {
    pub fn new(sink: Option<TraceSender>, worker_id: usize) -> Self {
        Self {
            sink,
            worker_id,
            spans: Vec::new(),
        }
    }

    /// Record a completed span; emits a batch when full. `frontier` is
    /// evaluated only at emission time and must return the minimum start
    /// timestamp of any request still in flight (or [`FRONTIER_DRAINED`]).
    pub fn push(&mut self, span: Span, frontier: impl FnOnce() -> u64) {
        if self.sink.is_none() {
            return;
        }
        self.spans.push(span);
        if self.spans.len() >= TRACE_BATCH_SIZE {
            self.emit(frontier());
        }
    }

    /// Flush residual spans on worker exit
    pub fn flush(&mut self) {
        if self.sink.is_some() && !self.spans.is_empty() {
            self.emit(FRONTIER_DRAINED);
        }
    }

    fn emit(&mut self, min_start_ns: u64) {
        if let Some(sink) = &self.sink {
            let msg = TraceMsg {
                worker_id: self.worker_id,
                spans: std::mem::take(&mut self.spans),
                min_start_ns,
            };
            // The analyzer owns the receiving side; if it is gone, traces
            // are simply dropped.
            let _ = sink.send(msg);
        }
    }
}

/// Nanoseconds since the engine epoch
#[inline]
pub(crate) fn since_epoch_ns(epoch: Instant, t: Instant) -> u64 {
    t.duration_since(epoch).as_nanos() as u64
}
