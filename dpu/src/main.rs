/*!
# DPU Readout Controller Application

Runs the readout processor against a camera front-end: synchronises to the
sync pulses, stores housekeeping and image data per readout cycle, and
dispatches commands inside the safe commanding window.

## Usage

### Run against the synthetic front-end
```bash
dpu run --simulate
```

### Generate a configuration file
```bash
dpu config --output dpu.toml
```
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dpu::config::DpuConfig;
use dpu::controller::{ProcessorHandle, ReadoutProcessor};
use dpu::facade::command_channels;
use dpu::monitor::MonitoringHub;
use dpu::sim::FeeSimulator;
use dpu::storage::{FileStorage, MemoryStorage, Storage};
use dpu::transport::ChannelTransport;

#[derive(Parser)]
#[command(name = "dpu")]
#[command(about = "Readout controller for the camera front-end electronics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "dpu.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the readout processor
    Run {
        /// Run against a synthetic front-end instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dpu.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Logging goes to stderr, stdout stays clean for status messages
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { simulate }) => run(cli.config, simulate),
        Some(Commands::Config { output }) => generate_config_file(output),
        None => run(cli.config, false),
    }
}

fn run(config_path: PathBuf, simulate: bool) -> Result<()> {
    let config = DpuConfig::load_from_file(&config_path).unwrap_or_else(|_| {
        eprintln!("⚠️ Failed to load config, using defaults");
        DpuConfig::new()
    });

    println!("🚀 Starting the DPU readout controller");
    println!("💾 Storage directory: {}", config.processor.storage_directory);

    let (transport, link) = ChannelTransport::pair();

    let mut simulator = if simulate {
        println!("🧪 Running against the synthetic front-end");
        let sim = FeeSimulator::new(link, Duration::from_millis(config.timing.cycle_period_ms));
        Some(sim.spawn())
    } else {
        // The in-process link is the only transport wired up here; without
        // the simulator the processor idles until a front-end connects.
        println!("📡 No front-end link configured, processor will idle");
        None
    };

    let storage: Box<dyn Storage> = if config.processor.enable_storage {
        Box::new(FileStorage::new(
            &config.processor.storage_directory,
            config.processor.origin.clone(),
        ))
    } else {
        println!("📺 Storage disabled, readout data is not persisted");
        Box::new(MemoryStorage::new())
    };

    let hub = MonitoringHub::new();
    let (facade, channels) = command_channels();
    let processor = ReadoutProcessor::new(config, Box::new(transport), storage, hub, channels);
    let mut handle = ProcessorHandle::spawn(processor);

    // Set up Ctrl+C handler
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })?;

    while !shutdown.load(Ordering::SeqCst) && handle.is_alive() {
        std::thread::sleep(Duration::from_millis(200));
    }

    if let Some(mut sim) = simulator.take() {
        sim.stop();
    }
    drop(facade);

    match handle.stop() {
        Some(Ok(())) => {
            println!("✅ Readout controller stopped");
            Ok(())
        }
        Some(Err(err)) => {
            eprintln!("Readout controller failed: {err}");
            Err(err.into())
        }
        None => anyhow::bail!("readout processor did not stop"),
    }
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = DpuConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   dpu run --config {}", output_path.display());

    Ok(())
}
