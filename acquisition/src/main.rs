/*!
# Exposure Acquisition Application

Acquires camera exposures whose start and end are timestamped against GPS
time, using an external timing unit's sync pulses.

## Features

- GPS timing packet decoding from the receiver's serial feed
- System/GPS clock correlation with drift-triggered time server resync
- USB timing unit or legacy timer card as the sync pulse source
- Missed pulse recovery using the clock model
- In-process hardware simulator for running without devices
- One JSON summary line per exposure on stdout

## Usage

### Simulated hardware
```bash
acquisition run --simulate --exposure 5 --count 10
```

### From a configuration file
```bash
acquisition --config acquisition.toml run
```

### Generate a configuration file
```bash
acquisition config --output acquisition.toml
```
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use acquisition::{AcquisitionDevices, AcquisitionEvent, AppConfig, ChannelSink, ExposureAcquisition};
use shared::correlation::CorrectionSnapshot;
use shared::time::format_millis;
use shared::Poller;

#[derive(Parser)]
#[command(name = "acquisition")]
#[command(about = "GPS-synchronised camera exposure acquisition")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "acquisition.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire exposures until interrupted
    Run {
        /// Use the in-process hardware simulator
        #[arg(long)]
        simulate: bool,

        /// Exposure time in seconds (overrides the config file)
        #[arg(short, long)]
        exposure: Option<u32>,

        /// Stop after this many exposures
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "acquisition.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr to keep stdout for exposure summaries
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Run {
            simulate,
            exposure,
            count,
        } => {
            let mut config = load_config(&cli.config)?;
            if simulate {
                config.acquisition.simulate_hardware = true;
            }
            if let Some(seconds) = exposure {
                config.acquisition.exposure_time_seconds = seconds;
            }
            if count.is_some() {
                config.acquisition.exposure_count = count;
            }
            run_acquisition(config)
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        info!("📝 Loading configuration from {}", path.display());
        AppConfig::load_from_file(path)
    } else {
        warn!("⚠️ Config file {} not found, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

/// Run the acquisition thread and the exposure consumer until done
fn run_acquisition(config: AppConfig) -> Result<()> {
    config.validate()?;

    let poller = Poller::system();
    let mut devices =
        AcquisitionDevices::open(&config, &poller, None).with_context(|| "Failed to open acquisition devices")?;
    let mut acquisition = ExposureAcquisition::new(&config, poller);

    // Set up Ctrl+C handler
    let running = acquisition.get_running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    let (event_tx, event_rx) = bounded::<AcquisitionEvent>(config.acquisition.channel_buffer_size);
    let mut sink = ChannelSink::new(event_tx);
    let dropped = sink.dropped_counter();

    let correction = acquisition.correction_snapshot();
    let consumer_handle = thread::spawn(move || consume_events(event_rx, correction));

    let acquisition_handle = thread::spawn(move || {
        let result = acquisition.run(&mut devices, &mut sink);
        // Dropping the sink closes the channel and ends the consumer
        drop(sink);
        result
    });

    let result = acquisition_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Acquisition thread panicked"))?;
    let consumed = consumer_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Consumer thread panicked"))?;

    let summary = result.context("Acquisition failed")?;
    summary.log();
    info!("📊 Exposures written: {}", consumed);
    let lost = dropped.load(Ordering::Relaxed);
    if lost > 0 {
        warn!("⚠️ Exposures dropped on a full channel: {}", lost);
    }

    info!("✅ Acquisition completed");
    Ok(())
}

/// Print one JSON line per exposure and log timing status reports.
/// Returns the number of exposures written.
fn consume_events(events: Receiver<AcquisitionEvent>, correction: CorrectionSnapshot) -> u64 {
    let mut written = 0;
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(AcquisitionEvent::Exposure(exposure)) => match exposure.summary_json() {
                Ok(line) => {
                    println!("{}", line);
                    written += 1;
                }
                Err(e) => error!("Failed to serialize exposure #{}: {}", exposure.sequence_number, e),
            },
            Ok(AcquisitionEvent::Status(status)) => {
                let describe = |ms: Option<i64>| ms.map(format_millis).unwrap_or_else(|| "none".to_string());
                let offset = if correction.has_measurement() {
                    format!("{} ms", correction.correction_ms())
                } else {
                    "unknown".to_string()
                };
                info!(
                    "🛰️ Timing unit: last sync {}, last GPS {}, system clock offset {}",
                    describe(status.last_sync_ms),
                    describe(status.last_gps_ms),
                    offset
                );
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    written
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   acquisition --config {} run", output_path.display());

    Ok(())
}
