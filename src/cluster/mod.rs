//! Cluster fan-out over agent HTTP servers
//!
//! A [`ClusterEngine`] presents the same `run` capability as a local
//! driver, but splits the workload across a list of agent nodes: workers
//! always divide across nodes, queue depth divides only when explicitly
//! set, and nodes whose share comes out to zero are skipped entirely
//! (otherwise the engine-side QD default would manufacture phantom load).
//! Per-node requests are bounded by a derived timeout so a dead agent
//! cannot hang the controller.

use crate::engine::{Engine, Params, RunResult, TerminationReason};
use crate::Result;
use anyhow::{anyhow, bail, Context as _};
use bytes::Bytes;
use http::{header, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;

/// Slack added to each node's max runtime before the request is abandoned
const NODE_TIMEOUT_GRACE: Duration = Duration::from_secs(5);
const NODE_TIMEOUT_FLOOR: Duration = Duration::from_secs(10);

pub struct ClusterEngine {
    nodes: Vec<String>,
}

impl ClusterEngine {
    pub fn new(nodes: Vec<String>) -> Self {
        Self { nodes }
    }
}

impl Engine for ClusterEngine {
    fn run(&self, params: &Params) -> Result<RunResult> {
        if self.nodes.is_empty() {
            bail!("cluster engine has no nodes");
        }

        let assignments = split_assignments(params, self.nodes.len());

        let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
        runtime.block_on(async {
            let mut tasks = Vec::new();
            for (node, assignment) in self.nodes.iter().zip(assignments) {
                let node = node.clone();
                if let Some(node_params) = assignment {
                    tasks.push((
                        node.clone(),
                        tokio::spawn(async move { run_remote(&node, node_params).await }),
                    ));
                }
            }
            if tasks.is_empty() {
                bail!("workload splits to zero work on every node");
            }

            let mut results = Vec::with_capacity(tasks.len());
            for (node, task) in tasks {
                let result = task
                    .await
                    .map_err(|err| anyhow!("task for node {} failed: {}", node, err))?
                    .with_context(|| format!("node {} failed", node))?;
                results.push(result);
            }
            Ok(aggregate(&results))
        })
    }
}

/// Per-node parameter splits; `None` marks a node with no work
fn split_assignments(params: &Params, node_count: usize) -> Vec<Option<Params>> {
    let base_workers = params.workers / node_count;
    let extra_workers = params.workers % node_count;
    let base_qd = params.queue_depth / node_count;
    let extra_qd = params.queue_depth % node_count;

    (0..node_count)
        .map(|i| {
            let mut node_params = params.clone();
            node_params.progress = None;
            node_params.trace = None;

            node_params.workers = base_workers + usize::from(i < extra_workers);
            if node_params.workers == 0 {
                return None;
            }

            if params.queue_depth > 0 {
                node_params.queue_depth = base_qd + usize::from(i < extra_qd);
                if node_params.queue_depth == 0 {
                    return None;
                }
            }

            Some(node_params)
        })
        .collect()
}

async fn run_remote(host: &str, params: Params) -> Result<RunResult> {
    let timeout = (params.max_runtime + NODE_TIMEOUT_GRACE).max(NODE_TIMEOUT_FLOOR);

    tokio::time::timeout(timeout, async {
        let stream = TcpStream::connect(host)
            .await
            .with_context(|| format!("failed to connect to agent {}", host))?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .with_context(|| format!("handshake with agent {} failed", host))?;
        tokio::spawn(connection);

        let body = serde_json::to_vec(&params)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/run")
            .header(header::HOST, host)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = sender
            .send_request(request)
            .await
            .with_context(|| format!("request to agent {} failed", host))?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            bail!(
                "agent {} error ({}): {}",
                host,
                status,
                String::from_utf8_lossy(&bytes).trim()
            );
        }
        Ok(serde_json::from_slice(&bytes)?)
    })
    .await
    .map_err(|_| anyhow!("agent {} timed out after {:?}", host, timeout))?
}

/// Combine per-node results into one cluster-wide result
///
/// Counts and rates add; duration and confidence take the worst node;
/// latency percentiles combine by operation-count weighting (the same
/// acknowledged approximation used for cache merges).
fn aggregate(results: &[RunResult]) -> RunResult {
    let mut total_ios = 0u64;
    let mut iops = 0.0;
    let mut throughput = 0.0;
    let mut duration = Duration::ZERO;
    let mut confidence = 0.0f64;
    let mut termination = TerminationReason::Timeout;

    let mut weighted_ns = [0.0f64; 5];
    let mut total_weight = 0.0f64;

    for r in results {
        total_ios += r.total_ios;
        iops += r.iops;
        throughput += r.throughput;
        duration = duration.max(r.duration);
        confidence = confidence.max(r.confidence);
        termination = r.termination;

        let weight = r.total_ios as f64;
        total_weight += weight;
        for (acc, latency) in weighted_ns.iter_mut().zip([
            r.mean_latency,
            r.p50_latency,
            r.p95_latency,
            r.p99_latency,
            r.p999_latency,
        ]) {
            *acc += latency.as_nanos() as f64 * weight;
        }
    }

    let latency = |i: usize| -> Duration {
        if total_weight > 0.0 {
            Duration::from_nanos((weighted_ns[i] / total_weight) as u64)
        } else {
            Duration::ZERO
        }
    };

    RunResult {
        iops,
        throughput,
        mean_latency: latency(0),
        p50_latency: latency(1),
        p95_latency: latency(2),
        p99_latency: latency(3),
        p999_latency: latency(4),
        total_ios,
        duration,
        confidence,
        termination,
    }
}
