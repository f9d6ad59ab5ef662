//! Central aggregation and liveness loop.
//!
//! The monitor is the single owner of all per-device state. Each poll
//! pass drains every report channel and the telemetry channel without
//! blocking, then sleeps a fixed responsiveness quantum. Rendering is
//! driven by data arrival; fuller summaries land at each 10% mark of the
//! run.

use std::{
    fmt::Write as _,
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::{
    report::{ChannelPoll, Report, ReportReceiver},
    shutdown::CancelToken,
    telemetry::TemperatureSample,
};

/// Monitor-owned aggregate for one device. The set of these is fixed at
/// run start.
#[derive(Debug, Clone)]
pub struct WorkerState {
    /// Stable identity, assigned at spawn.
    pub device_index: u32,
    /// Total iterations over the whole run.
    pub iterations: u64,
    /// Errors in the current summary window. Display-only; reset at each
    /// 10% summary.
    pub window_errors: u64,
    /// Throughput over the most recent inter-report interval.
    pub gflops: f64,
    /// False once a sentinel or unannounced channel closure is seen.
    /// Monotonic.
    pub alive: bool,
    /// Sticky: any window with errors marks the device faulty for the
    /// life of the run, whatever later windows say.
    pub faulty: bool,
    ops_per_iteration: u64,
    last_report: Instant,
    first_report: bool,
}

impl WorkerState {
    #[must_use]
    pub fn new(device_index: u32, ops_per_iteration: u64, now: Instant) -> Self {
        Self {
            device_index,
            iterations: 0,
            window_errors: 0,
            gflops: 0.0,
            alive: true,
            faulty: false,
            ops_per_iteration,
            last_report: now,
            first_report: true,
        }
    }

    /// Fold one report in. A sentinel only flips liveness; it never
    /// touches the counters.
    pub fn apply(&mut self, report: Report, now: Instant) {
        if report.is_sentinel() {
            self.alive = false;
            return;
        }

        let interval = now.duration_since(self.last_report).as_secs_f64();
        // No throughput without a valid prior baseline.
        self.gflops = if self.first_report || interval <= 0.0 {
            0.0
        } else {
            report.iterations as f64 * self.ops_per_iteration as f64 / interval / 1e9
        };
        self.first_report = false;
        self.last_report = now;

        self.iterations += report.iterations as u64;
        self.window_errors += report.errors as u64;
        if report.errors > 0 {
            self.faulty = true;
        }
    }

    /// Channel closed without a sentinel: the worker is gone all the same.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    fn reset_window(&mut self) {
        self.window_errors = 0;
    }
}

/// The whole run failed, not just one device.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Every worker is dead; monitoring zero live workers is pointless.
    #[error("all workers are dead")]
    AllWorkersDead,
}

/// Aggregates all workers' progress and decides run liveness.
pub struct Monitor {
    states: Vec<WorkerState>,
    channels: Vec<ReportReceiver>,
    /// Position-aligned with `states`, not with physical device indices.
    temperatures: Vec<Option<i64>>,
    telemetry: Option<mpsc::UnboundedReceiver<TemperatureSample>>,
    started: Instant,
    duration: Duration,
    poll_interval: Duration,
    next_summary_pct: f64,
    abort: CancelToken,
    bar: ProgressBar,
}

impl Monitor {
    /// `states` and `channels` are index-aligned, one pair per worker.
    #[must_use]
    pub fn new(
        states: Vec<WorkerState>,
        channels: Vec<ReportReceiver>,
        telemetry: Option<mpsc::UnboundedReceiver<TemperatureSample>>,
        duration: Duration,
        poll_interval: Duration,
        abort: CancelToken,
    ) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {percent:>3}% {msg}")
                .unwrap(),
        );
        let temperatures = vec![None; states.len()];
        Self {
            states,
            channels,
            temperatures,
            telemetry,
            started: Instant::now(),
            duration,
            poll_interval,
            next_summary_pct: 10.0,
            abort,
            bar,
        }
    }

    #[must_use]
    pub fn states(&self) -> &[WorkerState] {
        &self.states
    }

    /// Poll until the deadline or an abort request, then hand the final
    /// per-device state back for the terminal report.
    pub async fn run(mut self) -> Result<Vec<WorkerState>, MonitorError> {
        while self.started.elapsed() < self.duration && !self.abort.is_cancelled() {
            if let Err(e) = self.poll_pass(Instant::now()) {
                self.bar.finish_and_clear();
                return Err(e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.bar.finish_and_clear();
        Ok(self.states)
    }

    /// One non-blocking pass over every channel.
    pub fn poll_pass(&mut self, now: Instant) -> Result<(), MonitorError> {
        let mut fresh = false;

        for (state, rx) in self.states.iter_mut().zip(&mut self.channels) {
            loop {
                match rx.poll() {
                    ChannelPoll::Report(report) => {
                        state.apply(report, now);
                        fresh = true;
                    }
                    ChannelPoll::Empty => break,
                    ChannelPoll::Closed => {
                        if state.alive {
                            state.mark_dead();
                            fresh = true;
                        }
                        break;
                    }
                }
            }
        }

        if let Some(rx) = &mut self.telemetry {
            while let Ok(sample) = rx.try_recv() {
                // Samples are keyed by physical device index; workers may
                // cover only a subset of devices.
                let position = self
                    .states
                    .iter()
                    .position(|s| s.device_index as usize == sample.slot);
                if let Some(position) = position {
                    self.temperatures[position] = sample.celsius;
                }
            }
        }

        if self.states.iter().all(|s| !s.alive) {
            return Err(MonitorError::AllWorkersDead);
        }

        let pct = (now.duration_since(self.started).as_secs_f64()
            / self.duration.as_secs_f64()
            * 100.0)
            .min(100.0);

        if fresh {
            self.render(pct);
        }
        if pct >= self.next_summary_pct {
            self.summary(pct);
            self.next_summary_pct = pct + 10.0;
            for state in &mut self.states {
                state.reset_window();
            }
        }

        Ok(())
    }

    /// Live one-line render, emitted only when a pass saw new data.
    fn render(&self, pct: f64) {
        let mut msg = String::from("proc'd: ");
        for (i, s) in self.states.iter().enumerate() {
            if i > 0 {
                msg.push_str("- ");
            }
            if s.alive {
                let _ = write!(msg, "{} ({:.0} Gflop/s) ", s.iterations, s.gflops);
            } else {
                msg.push_str("-1 ");
            }
        }
        msg.push_str(" errors: ");
        for (i, s) in self.states.iter().enumerate() {
            if i > 0 {
                msg.push_str("- ");
            }
            let note = if !s.alive {
                " (DIED!)"
            } else if s.window_errors > 0 {
                " (WARNING!)"
            } else {
                ""
            };
            let _ = write!(msg, "{}{note} ", s.window_errors);
        }
        msg.push_str(" temps: ");
        for (i, temp) in self.temperatures.iter().enumerate() {
            if i > 0 {
                msg.push_str("- ");
            }
            match temp {
                Some(c) => {
                    let _ = write!(msg, "{c} C ");
                }
                None => msg.push_str("-- "),
            }
        }
        self.bar.set_position(pct as u64);
        self.bar.set_message(msg);
    }

    /// Fuller summary at each 10% boundary; the windowed error counters
    /// restart afterwards.
    fn summary(&self, pct: f64) {
        tracing::info!("summary at {pct:.0}% of the run");
        for (s, temp) in self.states.iter().zip(&self.temperatures) {
            let temp = temp.map_or_else(|| "--".to_string(), |c| format!("{c} C"));
            if s.alive {
                tracing::info!(
                    "device {}: {} iterations, {} errors this window, {:.0} Gflop/s, {temp}",
                    s.device_index,
                    s.iterations,
                    s.window_errors,
                    s.gflops,
                );
            } else {
                tracing::warn!(
                    "device {}: DEAD ({} iterations before death)",
                    s.device_index,
                    s.iterations
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report;

    const OPS: u64 = 2_000_000;

    fn fresh_state(now: Instant) -> WorkerState {
        WorkerState::new(0, OPS, now)
    }

    #[test]
    fn test_counters_sum_over_reports() {
        let t0 = Instant::now();
        let mut s = fresh_state(t0);
        s.apply(Report::progress(100, 0), t0 + Duration::from_secs(1));
        s.apply(Report::progress(250, 2), t0 + Duration::from_secs(2));
        s.apply(Report::progress(50, 0), t0 + Duration::from_secs(3));
        assert_eq!(s.iterations, 400);
        assert_eq!(s.window_errors, 2);
        assert!(s.alive);
    }

    #[test]
    fn test_sentinel_flips_liveness_without_touching_counters() {
        let t0 = Instant::now();
        let mut s = fresh_state(t0);
        s.apply(Report::progress(100, 1), t0 + Duration::from_secs(1));
        s.apply(Report::SENTINEL, t0 + Duration::from_secs(2));
        assert!(!s.alive);
        assert_eq!(s.iterations, 100);
        assert_eq!(s.window_errors, 1);
        // Liveness is monotonic: a later (garbage) report cannot revive it.
        assert!(!s.alive);
    }

    #[test]
    fn test_first_report_has_no_throughput() {
        let t0 = Instant::now();
        let mut s = fresh_state(t0);
        s.apply(Report::progress(1000, 0), t0 + Duration::from_secs(5));
        assert_eq!(s.gflops, 0.0);
    }

    #[test]
    fn test_throughput_from_inter_report_interval() {
        let t0 = Instant::now();
        let mut s = fresh_state(t0);
        s.apply(Report::progress(10, 0), t0 + Duration::from_secs(1));
        // 1000 iterations over 2 seconds: 500 * OPS per second.
        s.apply(Report::progress(1000, 0), t0 + Duration::from_secs(3));
        let expected = 500.0 * OPS as f64 / 1e9;
        assert!(
            (s.gflops - expected).abs() < 1e-9,
            "got {} want {expected}",
            s.gflops
        );
    }

    #[test]
    fn test_faulty_is_sticky_across_clean_windows() {
        let t0 = Instant::now();
        let mut s = fresh_state(t0);
        s.apply(Report::progress(100, 5), t0 + Duration::from_secs(1));
        assert!(s.faulty);
        s.reset_window();
        s.apply(Report::progress(100, 0), t0 + Duration::from_secs(2));
        assert_eq!(s.window_errors, 0);
        assert!(s.faulty);
    }

    fn monitor_with_workers(
        n: u32,
        duration: Duration,
    ) -> (Monitor, Vec<report::ReportSender>) {
        let now = Instant::now();
        let mut states = Vec::new();
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..n {
            let (tx, rx) = report::channel();
            states.push(WorkerState::new(i, OPS, now));
            senders.push(tx);
            receivers.push(rx);
        }
        let monitor = Monitor::new(
            states,
            receivers,
            None,
            duration,
            Duration::from_millis(50),
            CancelToken::new(),
        );
        (monitor, senders)
    }

    #[tokio::test]
    async fn test_all_dead_terminates_on_the_same_pass() {
        let (mut monitor, senders) = monitor_with_workers(2, Duration::from_secs(3600));
        senders[0].send_sentinel();
        senders[1].send_sentinel();
        assert!(matches!(
            monitor.poll_pass(Instant::now()),
            Err(MonitorError::AllWorkersDead)
        ));
    }

    #[tokio::test]
    async fn test_one_survivor_keeps_the_run_alive() {
        let (mut monitor, senders) = monitor_with_workers(2, Duration::from_secs(3600));

        // Device 1 dies immediately; device 0 keeps reporting, the second
        // window carrying errors.
        senders[1].send_sentinel();
        senders[0].send(Report::progress(100, 0)).unwrap();
        monitor.poll_pass(Instant::now()).unwrap();
        assert!(monitor.states()[0].alive);
        assert!(!monitor.states()[0].faulty);
        assert!(!monitor.states()[1].alive);

        senders[0].send(Report::progress(100, 5)).unwrap();
        monitor.poll_pass(Instant::now()).unwrap();
        assert!(monitor.states()[0].alive);
        assert!(monitor.states()[0].faulty);
        assert_eq!(monitor.states()[0].iterations, 200);
    }

    #[tokio::test]
    async fn test_unannounced_closure_marks_worker_dead() {
        let (mut monitor, mut senders) = monitor_with_workers(2, Duration::from_secs(3600));
        drop(senders.remove(1));
        monitor.poll_pass(Instant::now()).unwrap();
        assert!(!monitor.states()[1].alive);
        assert!(monitor.states()[0].alive);
    }

    #[tokio::test]
    async fn test_telemetry_samples_map_to_device_indices() {
        // One worker burning device 1 on a two-device host: it must show
        // device 1's temperature, never device 0's.
        let now = Instant::now();
        let (tx, rx) = report::channel();
        let (temp_tx, temp_rx) = mpsc::unbounded_channel();
        let mut monitor = Monitor::new(
            vec![WorkerState::new(1, OPS, now)],
            vec![rx],
            Some(temp_rx),
            Duration::from_secs(3600),
            Duration::from_millis(50),
            CancelToken::new(),
        );

        temp_tx
            .send(TemperatureSample {
                slot: 0,
                celsius: Some(40),
            })
            .unwrap();
        temp_tx
            .send(TemperatureSample {
                slot: 1,
                celsius: Some(75),
            })
            .unwrap();
        monitor.poll_pass(Instant::now()).unwrap();
        assert_eq!(monitor.temperatures, vec![Some(75)]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_summary_boundary_resets_windows() {
        let duration = Duration::from_secs(100);
        let (mut monitor, senders) = monitor_with_workers(1, duration);
        let start = monitor.started;

        senders[0].send(Report::progress(10, 3)).unwrap();
        monitor.poll_pass(start + Duration::from_secs(5)).unwrap();
        assert_eq!(monitor.states()[0].window_errors, 3);

        // Crossing the 10% boundary emits a summary and restarts windows.
        monitor.poll_pass(start + Duration::from_secs(11)).unwrap();
        assert_eq!(monitor.states()[0].window_errors, 0);
        assert!(monitor.states()[0].faulty);
        assert!((monitor.next_summary_pct - 21.0).abs() < 0.5);
    }
}
