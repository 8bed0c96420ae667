//! Jolt CLI entry point

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use jolt::analyze::sustain::{downsample, SustainAnalyzer};
use jolt::analyze::{linear::find_dominant_slope, Point};
use jolt::cluster::ClusterEngine;
use jolt::config::{Config, Metric, Objective, ObjectiveType, OptimizerKind, Settings, Variable};
use jolt::engine::{self, Engine, EngineKind, Params, Progress};
use jolt::optimize::annealing::AnnealingOptimizer;
use jolt::optimize::coordinate::CoordinateOptimizer;
use jolt::optimize::HistoryEntry;
use jolt::sweep::Sweeper;
use jolt::Result;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "jolt", version, about = "Adaptive I/O workload optimizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Default invocation runs the optimizer over these flags
    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Search the parameter space for the best operating point
    Optimize(SearchArgs),
    /// Evaluate every point of the sweep variable and report the knee
    Sweep(SearchArgs),
    /// Run at a fixed point for a duration and profile rate stability
    Sustain(SustainArgs),
    /// Expose this host as an agent for remote runs
    Agent(AgentArgs),
    /// Drive a search against a set of remote agents
    Remote(RemoteArgs),
}

#[derive(Args, Clone)]
struct SearchArgs {
    /// Path to configuration file (takes precedence over the other flags)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Save the effective configuration to this YAML file
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Path to device or file
    #[arg(long)]
    path: Option<PathBuf>,

    /// I/O engine
    #[arg(long, value_enum, default_value_t = EngineKind::Sync)]
    engine: EngineKind,

    /// Block size in bytes
    #[arg(long, default_value_t = 4096)]
    bs: usize,

    /// Use O_DIRECT
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    direct: bool,

    /// Read percentage (0-100; 0 = all writes)
    #[arg(long, default_value_t = 100)]
    read_pct: u8,

    /// Random I/O (sequential otherwise)
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    rand: bool,

    /// Minimum runtime per test point
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    min_runtime: Duration,

    /// Maximum runtime per test point
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    max_runtime: Duration,

    /// Target relative standard error (e.g. 0.05 for 5%)
    #[arg(long, default_value_t = 0.05)]
    error: f64,

    /// Variable to optimize: workers, queue_depth, block_size
    #[arg(long, default_value = "workers")]
    var: String,

    /// Minimum value of the search variable
    #[arg(long, default_value_t = 1)]
    min: i64,

    /// Maximum value of the search variable
    #[arg(long, default_value_t = 32)]
    max: i64,

    /// Step of the search variable
    #[arg(long, default_value_t = 1)]
    step: i64,

    /// Fixed worker count (when not optimizing workers)
    #[arg(long, default_value_t = 1)]
    workers: i64,

    /// Fixed global queue depth (when not optimizing queue_depth)
    #[arg(long, default_value_t = 1)]
    queue_depth: i64,

    /// Write the evaluation history to this JSON file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct SustainArgs {
    #[command(flatten)]
    search: SearchArgs,

    /// How long to run
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Time resolution of the output profile
    #[arg(long, default_value = "1ms", value_parser = humantime::parse_duration)]
    resolution: Duration,

    /// Relative error tolerance for the linearity analysis
    #[arg(long, default_value_t = 0.05)]
    tolerance: f64,

    /// Output CSV file
    #[arg(long, default_value = "stability.csv")]
    output: PathBuf,
}

#[derive(Args)]
struct AgentArgs {
    /// Port to listen on
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Target path override applied to every incoming request
    #[arg(long)]
    path: Option<PathBuf>,
}

#[derive(Args)]
struct RemoteArgs {
    #[command(subcommand)]
    command: RemoteCommand,
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Optimize across the agent nodes
    Optimize(RemoteSearchArgs),
    /// Sweep across the agent nodes
    Sweep(RemoteSearchArgs),
}

#[derive(Args)]
struct RemoteSearchArgs {
    #[command(flatten)]
    search: SearchArgs,

    /// Comma-separated agent hosts (e.g. host1:9000,host2:9000)
    #[arg(long)]
    nodes: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_optimize(&cli.search),
        Some(Command::Optimize(args)) => run_optimize(&args),
        Some(Command::Sweep(args)) => run_sweep(&args),
        Some(Command::Sustain(args)) => run_sustain(&args),
        Some(Command::Agent(args)) => {
            jolt::agent::AgentServer::new(args.port, args.path).serve()
        }
        Some(Command::Remote(args)) => run_remote(&args),
    }
}

impl SearchArgs {
    /// Resolve the config: load the file when given, otherwise build one
    /// from the flags.
    fn resolve_config(&self) -> Result<Config> {
        if let Some(config_path) = &self.config {
            return Config::load(config_path);
        }

        let path = match &self.path {
            Some(path) => path.clone(),
            None => bail!("--path is required when no --config file is given"),
        };

        let mut search = vec![Variable {
            name: self.var.clone(),
            values: vec![],
            range: Some([self.min, self.max]),
            step: self.step,
        }];
        // Pin the variables not being searched to their flag values.
        for (name, value) in [
            ("workers", self.workers),
            ("queue_depth", self.queue_depth),
            ("block_size", self.bs as i64),
        ] {
            if self.var != name {
                search.push(Variable {
                    name: name.to_string(),
                    values: vec![value],
                    range: None,
                    step: 0,
                });
            }
        }

        let cfg = Config {
            target: path,
            optimizer: OptimizerKind::Coordinate,
            settings: Settings {
                engine_type: self.engine,
                direct: self.direct,
                read_pct: self.read_pct,
                rand: self.rand,
                min_runtime: self.min_runtime,
                max_runtime: self.max_runtime,
                error_target: self.error,
                ..Settings::default()
            },
            search,
            objectives: vec![Objective {
                kind: ObjectiveType::Maximize,
                metric: Metric::Iops,
                limit: None,
            }],
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn maybe_write_config(&self, cfg: &Config) {
        if let Some(path) = &self.write_config {
            match cfg.save(path) {
                Ok(()) => println!("Configuration written to {}", path.display()),
                Err(err) => eprintln!("Warning: failed to write config: {:#}", err),
            }
        }
    }
}

fn run_optimize(args: &SearchArgs) -> Result<()> {
    let cfg = args.resolve_config()?;
    args.maybe_write_config(&cfg);
    let engine = engine::create(cfg.settings.engine_type)?;
    optimize_with_engine(args, cfg, engine)
}

fn optimize_with_engine(args: &SearchArgs, cfg: Config, engine: Box<dyn Engine>) -> Result<()> {
    let optimizer_kind = cfg.optimizer;
    println!(
        "Optimizing {} using {}...",
        cfg.target.display(),
        match optimizer_kind {
            OptimizerKind::Coordinate => "coordinate descent",
            OptimizerKind::SimulatedAnnealing => "simulated annealing",
        }
    );

    let (best_state, best_result, history) = match optimizer_kind {
        OptimizerKind::Coordinate => {
            let mut optimizer = CoordinateOptimizer::new(engine, cfg);
            let (state, result) = optimizer.optimize()?;
            (state, result, optimizer.history().to_vec())
        }
        OptimizerKind::SimulatedAnnealing => {
            let mut optimizer = AnnealingOptimizer::new(engine, cfg);
            let (state, result) = optimizer.optimize()?;
            (state, result, optimizer.history().to_vec())
        }
    };

    println!();
    println!(">>> Optimization complete <<<");
    println!("Best state: {:?}", best_state);
    println!(
        "Metrics:    IOPS={:.0}, throughput={:.2} MB/s",
        best_result.iops,
        best_result.throughput / 1024.0 / 1024.0
    );

    if let Some(report) = &args.report {
        write_report(report, &history);
    }
    Ok(())
}

fn run_sweep(args: &SearchArgs) -> Result<()> {
    let cfg = args.resolve_config()?;
    args.maybe_write_config(&cfg);
    let engine = engine::create(cfg.settings.engine_type)?;
    sweep_with_engine(args, cfg, engine)
}

fn sweep_with_engine(args: &SearchArgs, cfg: Config, engine: Box<dyn Engine>) -> Result<()> {
    let mut sweeper = Sweeper::new(engine, cfg);
    let (history, knee) = sweeper.run()?;

    println!();
    println!(">>> Sweep complete <<<");
    match knee {
        Some(point) => println!("Knee found at: {} (IOPS: {:.0})", point.x, point.y),
        None => println!("Could not identify a distinct knee."),
    }

    if let Some(report) = &args.report {
        write_report(report, &history);
    }
    Ok(())
}

fn run_sustain(args: &SustainArgs) -> Result<()> {
    let cfg = args.search.resolve_config()?;
    args.search.maybe_write_config(&cfg);

    // A config file pins the point via its search variables; plain flags
    // use the fixed values directly.
    let (workers, queue_depth, block_size) = if args.search.config.is_some() {
        (
            search_value(&cfg, "workers", 1) as usize,
            search_value(&cfg, "queue_depth", 1) as usize,
            search_value(&cfg, "block_size", 4096) as usize,
        )
    } else {
        (
            args.search.workers as usize,
            args.search.queue_depth as usize,
            args.search.bs,
        )
    };

    let mut params = Params {
        engine: cfg.settings.engine_type,
        path: cfg.target.clone(),
        block_size,
        direct: cfg.settings.direct,
        read_pct: cfg.settings.read_pct,
        random: cfg.settings.rand,
        workers,
        queue_depth,
        min_runtime: args.duration,
        max_runtime: args.duration,
        error_target: 0.0,
        progress: None,
        trace: None,
    };

    println!("Running sustain analysis for {:?}...", args.duration);
    println!(
        "Configuration: workers={}, qd={}, bs={}, engine={}",
        params.workers, params.queue_depth, params.block_size, params.engine
    );

    let (trace_tx, trace_rx) = crossbeam_channel::bounded(1024);
    let mut analyzer = SustainAnalyzer::new(trace_rx, params.effective_workers());
    let analyzer_handle = std::thread::spawn(move || {
        analyzer.run();
        analyzer
    });

    params.trace = Some(trace_tx);
    params.progress = Some(Arc::new(|p: Progress| {
        print!(
            "\rElapsed: {}s | IOPS: {:.0} | rel err: {:.4}",
            p.elapsed.as_secs(),
            p.iops,
            p.relative_error
        );
        let _ = std::io::stdout().flush();
    }));

    let engine = engine::create(params.engine)?;
    let run_outcome = engine.run(&params);
    println!();

    // Dropping the params releases the trace sender so the analyzer sees
    // the channel close and drains.
    drop(params);
    let result = run_outcome?;

    println!("Waiting for analysis to complete...");
    let analyzer = analyzer_handle
        .join()
        .map_err(|_| anyhow::anyhow!("analyzer thread panicked"))?;

    let mut points = analyzer.profile();
    // The final bin pairs total runtime with the lowest rate observed,
    // which is dominated by ramp-down; drop it.
    if !points.is_empty() {
        points.truncate(points.len() - 1);
    }
    let final_points = downsample(&points, args.resolution);

    write_stability_csv(&args.output, &final_points)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("Stability profile written to {}", args.output.display());
    println!("Average IOPS: {:.0}", result.iops);

    if final_points.len() > 2 {
        let fit = find_dominant_slope(&final_points, args.tolerance);
        let span = fit.end_x - fit.start_x;
        let variation = (fit.slope * span).abs();
        let mid_x = (fit.start_x + fit.end_x) / 2.0;
        let mean_iops = fit.intercept + fit.slope * mid_x;
        let relative_variation = if mean_iops > 0.0 {
            variation / mean_iops * 100.0
        } else {
            0.0
        };

        println!();
        println!(">>> Stability analysis <<<");
        println!(
            "Linear region: {:.1}% of the graph ({:.2}s - {:.2}s)",
            fit.coverage * 100.0,
            fit.start_x,
            fit.end_x
        );
        println!("Slope:         {:.4} IOPS/s", fit.slope);
        println!(
            "Variation:     {:.2} IOPS ({:.2}%) over {:.2}s",
            variation, relative_variation, span
        );
    }

    Ok(())
}

fn run_remote(args: &RemoteArgs) -> Result<()> {
    let (search, is_sweep) = match &args.command {
        RemoteCommand::Optimize(inner) => (&inner.search, false),
        RemoteCommand::Sweep(inner) => (&inner.search, true),
    };
    let nodes: Vec<String> = match &args.command {
        RemoteCommand::Optimize(inner) | RemoteCommand::Sweep(inner) => inner
            .nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    if nodes.is_empty() {
        bail!("--nodes is required for remote mode");
    }

    let cfg = search.resolve_config()?;
    search.maybe_write_config(&cfg);

    println!("Initializing cluster engine with {} nodes...", nodes.len());
    let engine: Box<dyn Engine> = Box::new(ClusterEngine::new(nodes));

    if is_sweep {
        sweep_with_engine(search, cfg, engine)
    } else {
        optimize_with_engine(search, cfg, engine)
    }
}

/// First configured value of a search variable, or the default
fn search_value(cfg: &Config, name: &str, default: i64) -> i64 {
    cfg.search
        .iter()
        .find(|v| v.name == name)
        .map(|v| v.first_value())
        .unwrap_or(default)
}

fn write_report(path: &PathBuf, history: &[HistoryEntry]) {
    let json = match serde_json::to_string_pretty(history) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("Failed to serialize report: {}", err);
            return;
        }
    };
    if let Err(err) = std::fs::write(path, json) {
        eprintln!("Failed to write report: {}", err);
        return;
    }
    println!("Report written to {}", path.display());
}

/// Two columns: cumulative seconds at four decimals, IOPS floor at two.
fn write_stability_csv(path: &PathBuf, points: &[Point]) -> Result<()> {
    let mut csv = String::from("Duration_Seconds,Min_IOPS\n");
    for p in points {
        let _ = writeln!(csv, "{:.4},{:.2}", p.x, p.y);
    }
    std::fs::write(path, csv)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> SearchArgs {
        SearchArgs {
            config: None,
            write_config: None,
            path: Some("/tmp/target.dat".into()),
            engine: EngineKind::Sync,
            bs: 4096,
            direct: false,
            read_pct: 100,
            rand: true,
            min_runtime: Duration::from_secs(1),
            max_runtime: Duration::from_secs(5),
            error: 0.05,
            var: "workers".into(),
            min: 1,
            max: 16,
            step: 1,
            workers: 1,
            queue_depth: 8,
            report: None,
        }
    }

    #[test]
    fn test_flags_build_search_space() {
        let cfg = base_args().resolve_config().unwrap();

        assert_eq!(cfg.target, PathBuf::from("/tmp/target.dat"));
        assert_eq!(cfg.search.len(), 3);
        assert_eq!(cfg.search[0].name, "workers");
        assert_eq!(cfg.search[0].range, Some([1, 16]));
        // Non-searched variables are pinned to their flag values.
        assert_eq!(cfg.search[1].name, "queue_depth");
        assert_eq!(cfg.search[1].values, vec![8]);
        assert_eq!(cfg.search[2].name, "block_size");
        assert_eq!(cfg.search[2].values, vec![4096]);
        assert_eq!(cfg.objectives.len(), 1);
    }

    #[test]
    fn test_searched_variable_is_not_pinned() {
        let mut args = base_args();
        args.var = "queue_depth".into();
        let cfg = args.resolve_config().unwrap();

        let names: Vec<&str> = cfg.search.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["queue_depth", "workers", "block_size"]);
        assert_eq!(cfg.search[0].range, Some([1, 16]));
    }

    #[test]
    fn test_missing_path_and_config_is_error() {
        let mut args = base_args();
        args.path = None;
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn test_search_value_lookup() {
        let cfg = base_args().resolve_config().unwrap();
        assert_eq!(search_value(&cfg, "queue_depth", 1), 8);
        assert_eq!(search_value(&cfg, "missing", 7), 7);
        // The swept variable resolves to its range minimum.
        assert_eq!(search_value(&cfg, "workers", 0), 1);
    }

    #[test]
    fn test_stability_csv_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stability.csv");
        write_stability_csv(
            &path,
            &[
                Point { x: 0.05, y: 20.0 },
                Point {
                    x: 0.15,
                    y: 10.333,
                },
            ],
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Duration_Seconds,Min_IOPS\n0.0500,20.00\n0.1500,10.33\n"
        );
    }
}
