//! CLI entry point for ppg-daq.
//!
//! Provides:
//! - `scan`: probe the multiplexer channels once and report what answered
//! - `run`: acquire until Ctrl+C (or `--duration-secs`), feeding a live
//!   history and a log publisher, then print per-sink metrics
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! ppg-daq scan
//! ppg-daq --simulate 0,3 run --duration-secs 5
//! PPG_DAQ_BUS__DEVICE_PATH=/dev/i2c-1 ppg-daq run --batch
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ppg_daq::acquisition::{ChannelOutcome, SchedulerState};
use ppg_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use ppg_daq::hardware::{ChannelId, SimulatedBus};
use ppg_daq::sinks::{BatchPublishSink, LiveHistory, LogPublisher, SamplePublishSink};
use ppg_daq::{logging, AcquisitionEngine};
use tracing::info;

#[derive(Parser)]
#[command(name = "ppg-daq")]
#[command(about = "Multi-channel MAX30102 acquisition over a TCA9548A multiplexer", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use a simulated bus with sensors on these channels (e.g. `0,3`)
    #[arg(long, global = true, value_delimiter = ',')]
    simulate: Option<Vec<u8>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan all channels once and print the responding sensors
    Scan,

    /// Acquire until interrupted
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Publish batched payloads instead of one message per sample
        #[arg(long)]
        batch: bool,

        /// Values kept per channel in the live history
        #[arg(long, default_value = "500")]
        history: usize,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let simulated = cli.simulate.as_deref().map(simulated_bus).transpose()?;

    match cli.command {
        Commands::Scan => scan(&settings, simulated),
        Commands::Run {
            duration_secs,
            batch,
            history,
        } => run(&settings, simulated, duration_secs.map(Duration::from_secs), batch, history).await,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn simulated_bus(channels: &[u8]) -> Result<SimulatedBus> {
    let bus = SimulatedBus::new();
    let hardware = bus.hardware();
    for &index in channels {
        let channel = ChannelId::try_from(index)?;
        let offset = u32::from(index) * 4_000;
        hardware.insert_pulsing_sensor(channel, 90_000 + offset, 60_000 + offset, 100);
    }
    Ok(bus)
}

fn scan(settings: &Settings, simulated: Option<SimulatedBus>) -> Result<()> {
    let engine = AcquisitionEngine::new(settings);
    let report = match simulated {
        Some(bus) => engine.scan_with_bus(bus),
        None => engine.scan()?,
    };

    println!("🔍 Channel scan ({})", settings.bus.device_path.display());
    for (channel, outcome) in report.outcomes() {
        let line = match outcome {
            ChannelOutcome::Active => "sensor ready".to_string(),
            ChannelOutcome::Absent => "no sensor".to_string(),
            ChannelOutcome::SelectFailed(err) => format!("select failed: {err}"),
            ChannelOutcome::InitFailed(err) => format!("init failed: {err}"),
        };
        println!("   channel {channel}: {line}");
    }
    println!("✅ Active channels: {:?}", report.active().as_slice());
    Ok(())
}

async fn run(
    settings: &Settings,
    simulated: Option<SimulatedBus>,
    duration: Option<Duration>,
    batch: bool,
    history_len: usize,
) -> Result<()> {
    let engine = AcquisitionEngine::new(settings);

    let history = LiveHistory::new(history_len);
    let view = history.view();
    engine.register_sink(history)?;

    let publisher = Arc::new(LogPublisher::new());
    let publish = &settings.publish;
    if batch {
        engine.register_sink(BatchPublishSink::new(
            publish.topic.clone(),
            Arc::clone(&publisher),
            settings.retry_policy(),
            publish.batch_rounds,
            publish.frequency_hz,
        ))?;
    } else {
        engine.register_sink(SamplePublishSink::new(
            publish.topic.clone(),
            Arc::clone(&publisher),
            settings.retry_policy(),
        ))?;
    }

    let handle = match simulated {
        Some(bus) => engine.start_with_bus(bus)?,
        None => engine.start()?,
    };
    let distributor = handle.distributor().clone();

    let status = handle
        .wait_for(|status| status.state >= SchedulerState::Running)
        .await?;
    println!("▶️  Sampling channels {:?}", status.active.as_slice());
    println!("   Press Ctrl+C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                info!("Interrupt received");
                break;
            }
            _ = &mut deadline => break,
            _ = report.tick() => {
                let status = handle.status();
                let snapshot = view.snapshot();
                let latest: Vec<String> = snapshot
                    .channels
                    .iter()
                    .filter_map(|(channel, trace)| {
                        Some(format!(
                            "{channel}: red={} ir={}",
                            trace.red.last()?,
                            trace.infrared.last()?
                        ))
                    })
                    .collect();
                println!(
                    "   rounds={} overruns={} degraded={:?} | {}",
                    status.rounds_completed,
                    status.overruns,
                    status.degraded,
                    latest.join(", ")
                );
            }
        }
    }

    println!("\n👋 Shutting down...");
    handle.shutdown().await?;

    for metrics in distributor.metrics_snapshot() {
        println!(
            "   {}: published={} delivered={} dropped={} ({:.2}%)",
            metrics.sink,
            metrics.total_published,
            metrics.total_delivered,
            metrics.total_dropped,
            metrics.drop_rate_percent
        );
    }
    println!("   payloads published: {}", publisher.messages());
    Ok(())
}
