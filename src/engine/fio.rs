//! External fio integration
//!
//! Translates [`Params`] into an fio job file, runs the `fio` binary with
//! JSON output, and folds the report back into a [`RunResult`]. This exists
//! for cross-checking the in-process drivers against the de-facto standard
//! load generator.

use super::{Engine, Params, RunResult, TerminationReason};
use crate::Result;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::process::Command;
use std::time::Duration;

/// Render the fio job file for a workload point
pub fn generate_job(params: &Params) -> String {
    let mut job = String::new();

    job.push_str("[global]\n");
    let ioengine = match params.engine {
        super::EngineKind::Uring => "io_uring",
        super::EngineKind::Sync => "sync",
        _ => "libaio",
    };
    let _ = writeln!(job, "ioengine={}", ioengine);
    let _ = writeln!(job, "filename={}", params.path.display());
    let _ = writeln!(job, "bs={}", params.block_size);
    let _ = writeln!(job, "direct={}", if params.direct { 1 } else { 0 });

    // Read/write mix
    let rw = match (params.read_pct, params.random) {
        (100, true) => "randread",
        (100, false) => "read",
        (0, true) => "randwrite",
        (0, false) => "write",
        (_, true) => "randrw",
        (_, false) => "rw",
    };
    let _ = writeln!(job, "rw={}", rw);
    if params.read_pct > 0 && params.read_pct < 100 {
        let _ = writeln!(job, "rwmixread={}", params.read_pct);
    }

    // Workers map to numjobs; the global queue depth is split into a
    // per-job iodepth, floored at one slot.
    let workers = params.workers.max(1);
    let iodepth = if params.queue_depth > 0 {
        (params.queue_depth / workers).max(1)
    } else {
        1
    };
    let _ = writeln!(job, "numjobs={}", workers);
    let _ = writeln!(job, "iodepth={}", iodepth);
    if workers > 1 {
        job.push_str("group_reporting\n");
    }

    let runtime = if params.max_runtime > Duration::ZERO {
        params.max_runtime
    } else {
        Duration::from_secs(10)
    };
    job.push_str("time_based\n");
    let _ = writeln!(job, "runtime={}s", runtime.as_secs().max(1));

    job.push_str("\n[jolt_job]\n");
    job
}

#[derive(Debug, Deserialize)]
struct FioOutput {
    #[serde(default)]
    jobs: Vec<FioJob>,
    #[serde(default)]
    client_stats: Vec<FioJob>,
}

#[derive(Debug, Deserialize, Default)]
struct FioJob {
    #[serde(default)]
    read: FioStats,
    #[serde(default)]
    write: FioStats,
}

#[derive(Debug, Deserialize, Default)]
struct FioStats {
    #[serde(default)]
    iops: f64,
    #[serde(default)]
    total_ios: u64,
    #[serde(default)]
    clat_ns: FioLatStats,
}

#[derive(Debug, Deserialize, Default)]
struct FioLatStats {
    #[serde(default)]
    mean: f64,
    #[serde(default)]
    percentile: HashMap<String, u64>,
}

/// Percentile lookup by numeric proximity
///
/// fio formats percentile keys with fixed decimals ("99.000000") but the
/// exact rendering varies across versions, so the nearest key wins rather
/// than an exact string match.
fn percentile_near(map: &HashMap<String, u64>, target: f64) -> Duration {
    let mut best: Option<(f64, u64)> = None;
    for (key, &value) in map {
        if let Ok(parsed) = key.parse::<f64>() {
            let distance = (parsed - target).abs();
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, value));
            }
        }
    }
    Duration::from_nanos(best.map(|(_, v)| v).unwrap_or(0))
}

/// Fold fio's JSON report into a run result
pub fn parse_output(json: &[u8], duration: Duration, block_size: usize) -> Result<RunResult> {
    let out: FioOutput = serde_json::from_slice(json).context("failed to parse fio output")?;
    let jobs = if out.jobs.is_empty() {
        &out.client_stats
    } else {
        &out.jobs
    };
    if jobs.is_empty() {
        bail!("fio output contains no jobs");
    }

    let mut total_ios = 0u64;
    let mut iops = 0.0;
    let mut mean_latency = Duration::ZERO;
    let mut p50 = Duration::ZERO;
    let mut p95 = Duration::ZERO;
    let mut p99 = Duration::ZERO;
    let mut p999 = Duration::ZERO;

    for job in jobs {
        total_ios += job.read.total_ios + job.write.total_ios;
        iops += job.read.iops + job.write.iops;

        // With group_reporting there is a single job block; mixed workloads
        // are combined by operation-count weighting.
        let read_count = job.read.total_ios as f64;
        let write_count = job.write.total_ios as f64;
        let count = read_count + write_count;
        if count > 0.0 {
            let weigh = |r: Duration, w: Duration| {
                Duration::from_nanos(
                    ((r.as_nanos() as f64 * read_count + w.as_nanos() as f64 * write_count) / count)
                        as u64,
                )
            };
            mean_latency = weigh(
                Duration::from_nanos(job.read.clat_ns.mean as u64),
                Duration::from_nanos(job.write.clat_ns.mean as u64),
            );
            p50 = weigh(
                percentile_near(&job.read.clat_ns.percentile, 50.0),
                percentile_near(&job.write.clat_ns.percentile, 50.0),
            );
            p95 = weigh(
                percentile_near(&job.read.clat_ns.percentile, 95.0),
                percentile_near(&job.write.clat_ns.percentile, 95.0),
            );
            p99 = weigh(
                percentile_near(&job.read.clat_ns.percentile, 99.0),
                percentile_near(&job.write.clat_ns.percentile, 99.0),
            );
            p999 = weigh(
                percentile_near(&job.read.clat_ns.percentile, 99.9),
                percentile_near(&job.write.clat_ns.percentile, 99.9),
            );
        }
    }

    Ok(RunResult {
        iops,
        throughput: iops * block_size as f64,
        mean_latency,
        p50_latency: p50,
        p95_latency: p95,
        p99_latency: p99,
        p999_latency: p999,
        total_ios,
        duration,
        confidence: 0.0,
        termination: TerminationReason::Timeout,
    })
}

/// Engine that shells out to the fio binary
pub struct FioEngine {
    binary: String,
}

impl FioEngine {
    pub fn new() -> Self {
        Self {
            binary: "fio".to_string(),
        }
    }
}

impl Default for FioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for FioEngine {
    fn run(&self, params: &Params) -> Result<RunResult> {
        params.validate()?;

        let job_path = std::env::temp_dir().join(format!("jolt-fio-{}.job", std::process::id()));
        std::fs::write(&job_path, generate_job(params))
            .with_context(|| format!("failed to write fio job file {}", job_path.display()))?;

        let started = std::time::Instant::now();
        let output = Command::new(&self.binary)
            .arg("--output-format=json")
            .arg(&job_path)
            .output()
            .with_context(|| format!("failed to execute {}", self.binary));
        let _ = std::fs::remove_file(&job_path);
        let output = output?;

        if !output.status.success() {
            bail!(
                "fio exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_output(&output.stdout, started.elapsed(), params.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;

    #[test]
    fn test_job_mixed_random_workload() {
        let params = Params {
            engine: EngineKind::Libaio,
            path: "/dev/nvme0n1".into(),
            block_size: 8192,
            direct: true,
            read_pct: 70,
            random: true,
            workers: 4,
            queue_depth: 32,
            max_runtime: Duration::from_secs(30),
            ..Params::default()
        };
        let job = generate_job(&params);

        assert!(job.contains("ioengine=libaio"));
        assert!(job.contains("filename=/dev/nvme0n1"));
        assert!(job.contains("bs=8192"));
        assert!(job.contains("direct=1"));
        assert!(job.contains("rw=randrw"));
        assert!(job.contains("rwmixread=70"));
        assert!(job.contains("numjobs=4"));
        assert!(job.contains("iodepth=8"));
        assert!(job.contains("group_reporting"));
        assert!(job.contains("time_based"));
        assert!(job.contains("runtime=30s"));
    }

    #[test]
    fn test_job_pure_sequential_read() {
        let params = Params {
            engine: EngineKind::Sync,
            path: "/tmp/x".into(),
            read_pct: 100,
            random: false,
            workers: 1,
            queue_depth: 1,
            ..Params::default()
        };
        let job = generate_job(&params);
        assert!(job.contains("rw=read"));
        assert!(!job.contains("rwmixread"));
        assert!(!job.contains("group_reporting"));
    }

    #[test]
    fn test_parse_output_with_variant_percentile_keys() {
        let json = br#"{
            "jobs": [{
                "read": {
                    "iops": 5000.0,
                    "total_ios": 50000,
                    "clat_ns": {
                        "mean": 200000.0,
                        "percentile": {
                            "50.000000": 150000,
                            "94.999999": 400000,
                            "99.000000": 900000,
                            "99.900000": 2000000
                        }
                    }
                },
                "write": {}
            }]
        }"#;

        let result = parse_output(json, Duration::from_secs(10), 4096).unwrap();
        assert_eq!(result.total_ios, 50000);
        assert_eq!(result.iops, 5000.0);
        assert_eq!(result.throughput, 5000.0 * 4096.0);
        assert_eq!(result.p50_latency, Duration::from_nanos(150000));
        // "94.999999" matches the p95 probe by proximity.
        assert_eq!(result.p95_latency, Duration::from_nanos(400000));
        assert_eq!(result.p99_latency, Duration::from_nanos(900000));
        assert_eq!(result.p999_latency, Duration::from_nanos(2000000));
    }

    #[test]
    fn test_parse_output_empty_is_error() {
        assert!(parse_output(br#"{"jobs": []}"#, Duration::from_secs(1), 4096).is_err());
    }
}
