//! CLI entry point for the workcell control hub
//!
//! A headless shell over [`WorkcellHub`]: it prints the log feed to the
//! terminal while a protocol or device test runs.
//!
//! # Usage
//!
//! Run the default protocol with 24 samples:
//! ```bash
//! workcell_hub run
//! ```
//!
//! Run one device's test operation:
//! ```bash
//! workcell_hub test "Liquid Handler"
//! ```
//!
//! Ctrl-C during a run triggers a confirmed emergency stop.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use workcell_hub::{
    LogEvent, LogLevel, SequencerState, WorkcellConfig, WorkcellHub, DEFAULT_CONFIG_PATH,
};

#[derive(Parser)]
#[command(name = "workcell_hub")]
#[command(about = "Simulated laboratory workcell control hub", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print feed events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a protocol to completion
    Run {
        /// Protocol name (defaults to the first catalog entry)
        #[arg(long)]
        protocol: Option<String>,

        /// Number of samples to process
        #[arg(long)]
        samples: Option<u32>,
    },

    /// Run one device's test operation
    Test {
        /// Device name
        device: String,
    },

    /// Print every device's current status
    Status,

    /// Print the effective configuration as TOML
    DumpConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WorkcellConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { protocol, samples } => {
            run_protocol(config, protocol, samples, cli.json).await
        }
        Commands::Test { device } => run_test(config, &device, cli.json).await,
        Commands::Status => print_status(config, cli.json).await,
        Commands::DumpConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_protocol(
    config: WorkcellConfig,
    protocol: Option<String>,
    samples: Option<u32>,
    json: bool,
) -> Result<()> {
    let sample_count = samples.unwrap_or(config.samples.default_count);
    let hub = WorkcellHub::spawn(config)?;
    let protocol = match protocol {
        Some(name) => name,
        None => hub
            .protocols()
            .first()
            .cloned()
            .context("protocol catalog is empty")?,
    };

    let mut logs = hub.subscribe_logs();
    let mut progress = hub.watch_progress();
    for event in hub.logs() {
        print_log(&event, json)?;
    }

    hub.start_protocol(&protocol, sample_count).await?;

    loop {
        tokio::select! {
            event = logs.recv() => match event {
                Ok(event) => print_log(&event, json)?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Log feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = progress.borrow_and_update().state;
                if matches!(
                    state,
                    SequencerState::Completed | SequencerState::Aborted | SequencerState::Paused
                ) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                hub.emergency_abort(true).await?;
            }
        }
    }

    drain_logs(&mut logs, json)?;
    let samples = hub.samples().await?;
    println!("{} samples tracked", samples.len());
    for sample in &samples {
        if json {
            println!("{}", serde_json::to_string(sample)?);
        } else {
            println!(
                "{}  {:<14} {:<16} {}",
                sample.id, sample.sample_type, sample.location, sample.status
            );
        }
    }

    hub.shutdown().await?;
    Ok(())
}

async fn run_test(config: WorkcellConfig, device: &str, json: bool) -> Result<()> {
    let mut poll = tokio::time::interval(config.timing.tick_interval);
    let hub = WorkcellHub::spawn(config)?;
    let mut logs = hub.subscribe_logs();

    let job = hub.start_test(device).await?;

    while hub.count_active().await > 0 {
        tokio::select! {
            event = logs.recv() => match event {
                Ok(event) => print_log(&event, json)?,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = poll.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                hub.emergency_abort(true).await?;
            }
        }
    }

    drain_logs(&mut logs, json)?;
    tracing::info!(job = job.id(), device, "Test finished");
    hub.shutdown().await?;
    Ok(())
}

async fn print_status(config: WorkcellConfig, json: bool) -> Result<()> {
    let hub = WorkcellHub::spawn(config)?;
    let states = hub.device_states().await;

    for name in hub.registry().names() {
        let Some(state) = states.get(name) else {
            continue;
        };
        if json {
            let line = serde_json::json!({
                "device": name,
                "status": state.status,
                "progress": state.progress,
            });
            println!("{line}");
        } else {
            println!("{:<18} {:<8} {:>3}%", name, state.status, state.progress);
        }
    }

    let stats = hub.stats().await;
    if !json {
        println!(
            "{} devices, {} active operations",
            stats.total_devices, stats.active_operations
        );
    }

    hub.shutdown().await?;
    Ok(())
}

fn ansi_color(level: LogLevel) -> &'static str {
    match level.color() {
        "red" => "\x1b[31m",
        "green" => "\x1b[32m",
        "orange" => "\x1b[33m",
        "blue" => "\x1b[34m",
        _ => "\x1b[0m",
    }
}

fn drain_logs(logs: &mut broadcast::Receiver<LogEvent>, json: bool) -> Result<()> {
    while let Ok(event) = logs.try_recv() {
        print_log(&event, json)?;
    }
    Ok(())
}

fn print_log(event: &LogEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}{}\x1b[0m", ansi_color(event.level), event);
    }
    Ok(())
}
