//! GPU Burn-In Harness CLI
//!
//! Spawns one worker per selected device, aggregates their progress,
//! polls temperatures, and shuts everything down at the deadline.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gpuburn::{
    config::{BurnConfig, DeviceSelection, MemorySpec, Precision},
    device::{CpuBackend, DeviceBackend},
    monitor::{Monitor, MonitorError, WorkerState},
    report,
    shutdown::{CancelToken, ShutdownCoordinator},
    telemetry::Telemetry,
    worker,
};

/// No devices could be enumerated or initialized.
const EXIT_NO_DEVICES: i32 = 2;
/// Every worker died mid-run; aborted early rather than idling out the
/// deadline.
const EXIT_ALL_WORKERS_DEAD: i32 = 3;

#[derive(Parser)]
#[command(name = "gpuburn", about = "GPU burn-in / stress-test harness")]
struct Cli {
    /// Burn duration in seconds
    #[arg(default_value_t = 10)]
    duration: u64,

    /// Working set per device: MiB count, or a percentage of free memory
    #[arg(short, long, default_value = "90%")]
    memory: MemorySpec,

    /// Stress with double precision
    #[arg(short = 'd', long)]
    doubles: bool,

    /// Ask the backend for specialized matrix-math acceleration
    #[arg(long)]
    tensor_cores: bool,

    /// Burn only the device with this index (default: all devices)
    #[arg(short = 'i', long)]
    device: Option<u32>,

    /// Path to the verification routine
    #[arg(short = 'c', long, default_value = "compare.ptx")]
    compare: String,

    /// Seconds to wait for workers to stop before abandoning them
    #[arg(long, default_value_t = 30)]
    grace: u64,

    /// List devices and exit
    #[arg(short = 'l', long)]
    list: bool,
}

#[tokio::main]
async fn main() {
    // tracing needs to be initialized with indicatif_layer to not clobber
    // the live progress line
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();
    let config = BurnConfig {
        duration: Duration::from_secs(cli.duration),
        memory: cli.memory,
        precision: if cli.doubles {
            Precision::Double
        } else {
            Precision::Single
        },
        tensor_cores: cli.tensor_cores,
        devices: cli.device.map_or(DeviceSelection::All, DeviceSelection::Index),
        compare_module: cli.compare,
        grace: Duration::from_secs(cli.grace),
        ..BurnConfig::default()
    };

    let backend: Arc<dyn DeviceBackend> = Arc::new(CpuBackend::default());
    let code = run(backend, config, cli.list).await;
    // Exit directly: dropping the runtime would wait for abandoned
    // blocking workers, unbounding the shutdown we just bounded.
    std::process::exit(code);
}

async fn run(backend: Arc<dyn DeviceBackend>, config: BurnConfig, list: bool) -> i32 {
    let count = match backend.device_count() {
        Ok(count) => count,
        Err(e) => {
            eprintln!("Couldn't enumerate devices: {e}");
            return EXIT_NO_DEVICES;
        }
    };
    if count == 0 {
        eprintln!("No compute devices");
        return EXIT_NO_DEVICES;
    }

    if list {
        for index in 0..count as u32 {
            match backend.describe(index) {
                Ok(info) => println!(
                    "ID {}: {}, {}MB",
                    info.index,
                    info.name,
                    info.total_memory / 1000 / 1000
                ),
                Err(e) => eprintln!("ID {index}: {e}"),
            }
        }
        return 0;
    }

    let indices: Vec<u32> = match config.devices {
        DeviceSelection::All => (0..count as u32).collect(),
        DeviceSelection::Index(index) => {
            if (index as usize) < count {
                vec![index]
            } else {
                eprintln!("No such device: {index}");
                return EXIT_NO_DEVICES;
            }
        }
    };

    tracing::info!(
        "burning {} device(s) for {}s",
        indices.len(),
        config.duration.as_secs()
    );

    let cancel = CancelToken::new();
    let abort = CancelToken::new();
    {
        // Ctrl-C takes the same shutdown path as deadline expiry.
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("abort requested");
                abort.cancel();
            }
        });
    }

    let spawned_at = Instant::now();
    let mut states = Vec::new();
    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for &index in &indices {
        let (tx, rx) = report::channel();
        states.push(WorkerState::new(index, backend.ops_per_iteration(), spawned_at));
        receivers.push(rx);
        handles.push(worker::spawn_worker(
            Arc::clone(&backend),
            index,
            config.clone(),
            cancel.clone(),
            tx,
        ));
    }

    // The collaborator reports every physical device, selected or not.
    let (telemetry, temperature_rx) = match Telemetry::spawn(count) {
        Some((telemetry, rx)) => (Some(telemetry), Some(rx)),
        None => (None, None),
    };

    let monitor = Monitor::new(
        states,
        receivers,
        temperature_rx,
        config.duration,
        config.poll_interval,
        abort,
    );
    let outcome = monitor.run().await;

    let mut coordinator = ShutdownCoordinator::new(cancel, config.grace);
    let abandoned = coordinator.shutdown(handles, telemetry).await;
    if abandoned > 0 {
        tracing::warn!("{abandoned} worker(s) had to be abandoned");
    }

    match outcome {
        Ok(states) => {
            print_verdicts(&states);
            0
        }
        Err(MonitorError::AllWorkersDead) => {
            eprintln!("\nNo workers are alive! Aborting");
            EXIT_ALL_WORKERS_DEAD
        }
    }
}

fn print_verdicts(states: &[WorkerState]) {
    println!("\nTested {} device(s):", states.len());
    for state in states {
        let verdict = if state.faulty { "FAULTY" } else { "OK" };
        let died = if state.alive { "" } else { " (died during run)" };
        println!("\tDevice {}: {verdict}{died}", state.device_index);
    }
}
