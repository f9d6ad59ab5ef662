//! Coordinated, timeout-escalating shutdown.
//!
//! Cancellation is cooperative and level-triggered: one shared flag,
//! written here, read by every worker at the top of its loop. Workers
//! that do not stop within the grace period are abandoned. Each worker
//! thread owns all of its resources, so abandonment cannot corrupt
//! anything shared, and the threads die with the process.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, timeout_at},
};

use crate::telemetry::Telemetry;

/// Shared cooperative cancellation flag. Monotonic: once cancelled,
/// forever cancelled, so a worker that checks late still sees it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Where the shutdown sequence currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// The cancellation flag is set; waiting out the grace period.
    Cancelling,
    /// Grace expired; stragglers are being forcibly reclaimed.
    Reaping,
    Done,
}

/// Drives `Running -> Cancelling -> Reaping -> Done` once the deadline
/// or an abort request fires.
pub struct ShutdownCoordinator {
    cancel: CancelToken,
    grace: Duration,
    phase: Phase,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(cancel: CancelToken, grace: Duration) -> Self {
        Self {
            cancel,
            grace,
            phase: Phase::Running,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Stop everything. Returns the number of workers that had to be
    /// abandoned. Bounded: completes within the grace period plus
    /// scheduling noise, never hangs on an uncooperative worker.
    pub async fn shutdown(
        &mut self,
        workers: Vec<JoinHandle<()>>,
        telemetry: Option<Telemetry>,
    ) -> usize {
        self.phase = Phase::Cancelling;
        self.cancel.cancel();
        tracing::info!("terminating workers");

        let deadline = Instant::now() + self.grace;
        let mut stragglers = Vec::new();
        for (idx, mut handle) in workers.into_iter().enumerate() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("worker {idx} panicked: {e}"),
                Err(_) => stragglers.push((idx, handle)),
            }
        }

        self.phase = Phase::Reaping;
        let abandoned = stragglers.len();
        for (idx, handle) in stragglers {
            tracing::warn!(
                "worker {idx} ignored cancellation for {:?}, abandoning it",
                self.grace
            );
            // A blocking thread cannot be interrupted; dropping the handle
            // detaches it and its resources die with the process.
            handle.abort();
        }

        if let Some(telemetry) = telemetry {
            telemetry.stop().await;
        }

        self.phase = Phase::Done;
        abandoned
    }
}
