//! Per-device worker execution.
//!
//! One worker owns one open device handle and burns it until cancelled or
//! fatally broken. Workers run on their own OS threads and own every
//! resource they touch, so an uncooperative worker can be abandoned
//! without corrupting anything shared.

use std::{sync::Arc, thread, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    config::BurnConfig,
    device::{DeviceBackend, DeviceCompute, DeviceError, MARKER_SLOTS},
    report::{Report, ReportSender},
    shutdown::CancelToken,
};

/// Passes before the first report. Primes the marker ring; their work
/// folds into the first report.
const WARMUP_PASSES: u32 = MARKER_SLOTS as u32;

/// Sleep between completion-marker polls.
const MARKER_POLL: Duration = Duration::from_millis(1);

/// Spawn a worker for one device on a dedicated blocking thread.
///
/// Device construction happens inside the worker so an init failure is
/// reported the same way as any other fatal worker error: a sentinel,
/// then channel closure.
pub fn spawn_worker(
    backend: Arc<dyn DeviceBackend>,
    index: u32,
    config: BurnConfig,
    cancel: CancelToken,
    tx: ReportSender,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let device = match backend.open(index, &config) {
            Ok(device) => device,
            Err(e) => {
                tracing::error!("device {index}: couldn't init: {e}");
                tx.send_sentinel();
                return;
            }
        };
        tracing::info!(
            "device {index}: worker started, {} iterations per pass",
            device.iterations_per_pass()
        );
        run_worker(device, index, &cancel, tx);
    })
}

/// Run the burn loop to completion. Consumes the sender: when this
/// returns, the report channel is closed.
pub fn run_worker(
    mut device: Box<dyn DeviceCompute>,
    index: u32,
    cancel: &CancelToken,
    tx: ReportSender,
) {
    match burn_loop(device.as_mut(), cancel, &tx) {
        Ok(()) => tracing::info!("device {index}: worker stopped"),
        Err(e) => {
            tracing::error!("device {index}: failure during compute: {e}");
            tx.send_sentinel();
        }
    }
}

fn burn_loop(
    device: &mut dyn DeviceCompute,
    cancel: &CancelToken,
    tx: &ReportSender,
) -> Result<(), DeviceError> {
    let mut slot = 0;
    let mut warmup = WARMUP_PASSES;
    let mut iterations: u64 = 0;
    let mut errors: u64 = 0;

    // Prime every slot so the oldest-marker wait below always polls a
    // marker that was actually recorded.
    for slot in 0..MARKER_SLOTS {
        device.record_marker(slot)?;
    }

    while !cancel.is_cancelled() {
        device.run_iteration()?;
        let faults = device.verify()?;
        device.record_marker(slot)?;
        slot = (slot + 1) % MARKER_SLOTS;

        // Wait only for the oldest marker; the pass just issued keeps the
        // device saturated while the previous one settles.
        while !device.marker_ready(slot)? {
            thread::sleep(MARKER_POLL);
        }

        iterations += device.iterations_per_pass();
        errors += faults;

        if warmup > 0 {
            warmup -= 1;
            continue;
        }

        if tx.send(Report::progress(iterations, errors)).is_err() {
            // Monitor is gone. Expected at shutdown races; stop reporting
            // and wind down.
            return Ok(());
        }
        iterations = 0;
        errors = 0;
    }

    // Cancelled: flush whatever the in-flight pass (or warmup) left
    // unreported before closing the channel.
    if iterations > 0 || errors > 0 {
        let _ = tx.send(Report::progress(iterations, errors));
    }
    Ok(())
}
