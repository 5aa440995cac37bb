// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Timetravel CLI
//!
//! Drives synthetic multi-service workloads through the capture path and
//! replays them.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use timetravel_core::{
    now_us, CaptureConfig, ConfigOverrides, DescribeVariables, EventId, FlowQuery, FlowSummary,
    Preset, ReplaySnapshot, ReplayStatus, SessionId, StatsSnapshot, VariableSnapshot,
};
use timetravel_observability::{init_logging, LogFormat, LoggingConfig, LOG_FORMAT_ENV};
use timetravel_query::{AdvanceOutcome, CaptureOutcome, CaptureRequest, TimeTravel};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "timetravel")]
#[command(about = "Timetravel - event capture and replay", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TIMETRAVEL_CONFIG")]
    config: Option<PathBuf>,

    /// Preset to start from when no configuration file is given
    #[arg(long)]
    preset: Option<Preset>,

    /// Override the sampling rate
    #[arg(long)]
    sampling_rate: Option<f64>,

    /// Override the ring buffer capacity
    #[arg(long)]
    capacity: Option<usize>,

    /// Log output format (pretty, json)
    #[arg(long, env = LOG_FORMAT_ENV, default_value = "pretty")]
    log_format: LogFormat,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration presets
    Presets,

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },

    /// Capture a synthetic workload and print stats and flows
    Simulate {
        #[command(flatten)]
        workload: Workload,

        /// Number of flows to print
        #[arg(long, default_value = "10")]
        show: usize,

        /// Only print flows containing a failure
        #[arg(long)]
        errors_only: bool,
    },

    /// Capture a synthetic workload, then replay one flow
    ReplayFlow {
        #[command(flatten)]
        workload: Workload,

        /// Flow to replay (defaults to the most recent one)
        #[arg(long)]
        correlation_id: Option<String>,

        /// Replay speed multiplier
        #[arg(long, default_value = "100")]
        speed: f64,
    },

    /// Capture a synthetic workload, then replay everything in time order
    ReplaySystem {
        #[command(flatten)]
        workload: Workload,

        /// Replay speed multiplier
        #[arg(long, default_value = "100")]
        speed: f64,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<u64>,
    },
}

#[derive(Args, Clone)]
struct Workload {
    /// Number of flows (correlation ids)
    #[arg(long, default_value = "100")]
    flows: usize,

    /// Steps per flow
    #[arg(long, default_value = "8")]
    steps: usize,

    /// Number of distinct services
    #[arg(long, default_value = "4")]
    services: usize,

    /// Probability that a step fails
    #[arg(long, default_value = "0.05")]
    failure_rate: f64,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Synthetic message state
struct Step {
    index: usize,
    amount: u64,
    retries: u8,
}

impl DescribeVariables for Step {
    fn describe_variables(&self, snapshot: &mut VariableSnapshot) {
        snapshot.insert("step".into(), self.index.into());
        snapshot.insert("amount".into(), self.amount.into());
        snapshot.insert("retries".into(), self.retries.into());
    }
}

const EVENT_TYPES: [&str; 6] = [
    "RequestReceived",
    "Validated",
    "InventoryReserved",
    "PaymentCharged",
    "Notified",
    "Completed",
];

#[derive(Debug, Default, Serialize)]
struct CaptureCounts {
    captured: u64,
    sampled_out: u64,
    disabled: u64,
    dropped: u64,
}

#[derive(Serialize)]
struct SimulationReport {
    sampling_rate: f64,
    counts: CaptureCounts,
    stats: StatsSnapshot,
    flows: Vec<FlowSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let mut logging = LoggingConfig::default().format(cli.log_format);
    if cli.verbose {
        logging = logging.directive("timetravel=debug");
    }
    init_logging(&logging);

    run(&cli).await
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Presets => print_presets(cli.json),
        Commands::CheckConfig { path } => check_config(path, cli.json),
        Commands::Simulate {
            workload,
            show,
            errors_only,
        } => {
            let engine = start_engine(cli)?;
            let result = simulate(&engine, workload, *show, *errors_only, cli.json);
            engine.shutdown().await;
            result
        }
        Commands::ReplayFlow {
            workload,
            correlation_id,
            speed,
        } => {
            let engine = start_engine(cli)?;
            let result =
                replay_flow(&engine, workload, correlation_id.as_deref(), *speed, cli.json).await;
            engine.shutdown().await;
            result
        }
        Commands::ReplaySystem {
            workload,
            speed,
            limit,
        } => {
            let engine = start_engine(cli)?;
            let result = replay_system(&engine, workload, *speed, *limit, cli.json).await;
            engine.shutdown().await;
            result
        }
    }
}

fn start_engine(cli: &Cli) -> Result<TimeTravel> {
    let config = load_config(cli)?;
    let engine = TimeTravel::new(config).context("Failed to build capture engine")?;
    engine.start();
    Ok(engine)
}

fn load_config(cli: &Cli) -> Result<CaptureConfig> {
    let config = match (&cli.config, cli.preset) {
        (None, Some(preset)) => CaptureConfig::from_preset(preset),
        (path, _) => CaptureConfig::load(path.as_deref()).context("Failed to load configuration")?,
    };
    let overrides = ConfigOverrides {
        sampling_rate: cli.sampling_rate,
        buffer_capacity: cli.capacity,
        ..ConfigOverrides::default()
    };
    let config = config.with_overrides(&overrides);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_presets(json: bool) -> Result<()> {
    let presets: Vec<CaptureConfig> = Preset::ALL
        .into_iter()
        .map(CaptureConfig::from_preset)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(());
    }

    println!(
        "{:<24} {:>8} {:>10} {:>8} {:>12}",
        "PRESET", "RATE", "CAPACITY", "STATE", "MEMORY"
    );
    for config in &presets {
        println!(
            "{:<24} {:>8.2} {:>10} {:>8} {:>10}KB",
            config.preset.name(),
            config.sampling_rate,
            config.buffer_capacity,
            config.capture_state,
            config.memory_ceiling_bytes() / 1024
        );
    }
    Ok(())
}

fn check_config(path: &Path, json: bool) -> Result<()> {
    let config = CaptureConfig::from_file(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("✓ {:?} is valid", path);
        println!(
            "  Preset: {}, Rate: {}, Capacity: {}, State capture: {}",
            config.preset, config.sampling_rate, config.buffer_capacity, config.capture_state
        );
    }
    Ok(())
}

/// Capture a seeded synthetic workload.
///
/// Flows interleave: every round emits one step for each flow still running,
/// on a randomly chosen service, parented to the flow's previous step.
fn run_workload(engine: &TimeTravel, workload: &Workload) -> Result<CaptureCounts> {
    if !(0.0..=1.0).contains(&workload.failure_rate) {
        bail!("failure rate must be within [0, 1], got {}", workload.failure_rate);
    }
    if workload.services == 0 {
        bail!("at least one service is required");
    }

    let mut rng = StdRng::seed_from_u64(workload.seed);
    let services: Vec<String> = (0..workload.services)
        .map(|i| format!("svc-{}", i))
        .collect();
    let flows: Vec<String> = (0..workload.flows)
        .map(|i| format!("flow-{:05}", i))
        .collect();
    let mut parents: Vec<Option<EventId>> = vec![None; flows.len()];
    let mut clock = now_us();
    let mut counts = CaptureCounts::default();

    info!(
        flows = workload.flows,
        steps = workload.steps,
        services = workload.services,
        seed = workload.seed,
        "Running synthetic workload"
    );

    for index in 0..workload.steps {
        for (flow, parent) in flows.iter().zip(parents.iter_mut()) {
            clock += rng.gen_range(50..2_000);
            let service = &services[rng.gen_range(0..services.len())];
            let event_type = EVENT_TYPES[index % EVENT_TYPES.len()];

            let mut request = CaptureRequest::new(flow, event_type, service).at(clock);
            if rng.gen_bool(workload.failure_rate) {
                request = request.failed();
            }
            if let Some(id) = *parent {
                request = request.parent(id);
            }
            let step = Step {
                index,
                amount: rng.gen_range(1..10_000),
                retries: rng.gen_range(0..3),
            };

            match engine.capture(&request, Some(&step)) {
                CaptureOutcome::Captured { id, .. } => {
                    counts.captured += 1;
                    *parent = Some(id);
                }
                CaptureOutcome::SampledOut => counts.sampled_out += 1,
                CaptureOutcome::Disabled => counts.disabled += 1,
                CaptureOutcome::Dropped(_) => counts.dropped += 1,
            }
        }
    }

    Ok(counts)
}

fn simulate(
    engine: &TimeTravel,
    workload: &Workload,
    show: usize,
    errors_only: bool,
    json: bool,
) -> Result<()> {
    let start = std::time::Instant::now();
    let counts = run_workload(engine, workload)?;
    let duration = start.elapsed();

    let mut query = FlowQuery::new().limit(show);
    if errors_only {
        query = query.errors_only();
    }
    let report = SimulationReport {
        sampling_rate: engine.sampler().rate(),
        counts,
        stats: engine.stats(),
        flows: engine.list_flows(&query),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let attempted = workload.flows * workload.steps;
    println!(
        "✓ Captured {} of {} events in {:.2}ms",
        report.counts.captured,
        attempted,
        duration.as_secs_f64() * 1_000.0
    );
    println!(
        "  Sampled out: {}, Dropped: {}, Rate: {:.3}",
        report.counts.sampled_out, report.counts.dropped, report.sampling_rate
    );
    println!();
    print_stats(&report.stats);
    println!();
    println!("Recent flows ({}):", report.flows.len());
    for flow in &report.flows {
        println!(
            "  {} - {} events, {}µs{}  [{}]",
            flow.correlation_id,
            flow.event_count,
            flow.duration_us(),
            if flow.has_error { ", failed" } else { "" },
            flow.services.join(", ")
        );
    }
    Ok(())
}

fn print_stats(stats: &StatsSnapshot) {
    println!("Timetravel Statistics");
    println!("=====================");
    println!("  Lifetime events: {}", stats.total_events_lifetime);
    println!("  Stored events: {}", stats.events_currently_stored);
    println!("  Tracked flows: {}", stats.flows_currently_tracked);
    println!("  Approx. bytes: {}", stats.approx_storage_bytes);
    println!("  Growth: {:.1} events/s", stats.growth_rate_per_second);
    println!(
        "  Sampled out: {}, Append dropped: {}, Capture failures: {}",
        stats.sampled_out, stats.append_dropped, stats.capture_failures
    );
    println!("  Broadcast dropped: {}", stats.broadcast_dropped);
}

async fn replay_flow(
    engine: &TimeTravel,
    workload: &Workload,
    correlation_id: Option<&str>,
    speed: f64,
    json: bool,
) -> Result<()> {
    run_workload(engine, workload)?;

    let target = match correlation_id {
        Some(id) => id.to_string(),
        None => match engine.list_flows(&FlowQuery::new().limit(1)).into_iter().next() {
            Some(flow) => flow.correlation_id,
            None => bail!("no flows were captured; raise the sampling rate"),
        },
    };

    let session = engine
        .start_flow_replay(&target, speed)
        .with_context(|| format!("Failed to start replay of {}", target))?;
    run_replay(engine, session, None, json).await
}

async fn replay_system(
    engine: &TimeTravel,
    workload: &Workload,
    speed: f64,
    limit: Option<u64>,
    json: bool,
) -> Result<()> {
    let start_us = now_us();
    run_workload(engine, workload)?;

    let session = engine
        .start_system_replay(start_us, u64::MAX, speed)
        .context("Failed to start system replay")?;
    run_replay(engine, session, limit, json).await
}

async fn run_replay(
    engine: &TimeTravel,
    session: ReplaySnapshot,
    limit: Option<u64>,
    json: bool,
) -> Result<()> {
    let id: SessionId = session.id;
    if !json {
        println!(
            "Replaying {} events ({:?}, speed {}x)",
            session.total, session.mode, session.speed
        );
    }

    loop {
        match engine.advance(id).await? {
            AdvanceOutcome::Event(step) => {
                if json {
                    println!("{}", serde_json::to_string(&*step.event)?);
                } else {
                    let event = &step.event;
                    println!(
                        "  {:>4}. {} {:<18} {:<8} {:<11} {}{}",
                        step.position,
                        format_timestamp(event.timestamp_us),
                        event.event_type,
                        event.service,
                        event.correlation_id,
                        event.id,
                        if event.outcome.is_failure() { " ✗" } else { "" }
                    );
                }
                if limit.is_some_and(|limit| step.position >= limit) {
                    engine.cancel(id)?;
                    break;
                }
            }
            AdvanceOutcome::Completed(_) | AdvanceOutcome::Cancelled(_) => break,
            AdvanceOutcome::Paused(_) => engine.resume(id).map(|_| ())?,
        }
    }

    let snapshot = engine.replay_snapshot(id)?;
    if snapshot.status == ReplayStatus::FailedWithGap {
        warn!(skipped = snapshot.skipped, "Replay skipped evicted events");
    }
    if json {
        println!("{}", serde_json::to_string(&snapshot)?);
    } else {
        println!(
            "✓ Replay {:?}: {} delivered, {} skipped",
            snapshot.status, snapshot.delivered, snapshot.skipped
        );
    }
    Ok(())
}

fn format_timestamp(timestamp_us: u64) -> String {
    i64::try_from(timestamp_us)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_micros)
        .map(|ts| ts.format("%H:%M:%S%.6f").to_string())
        .unwrap_or_else(|| timestamp_us.to_string())
}
