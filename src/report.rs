//! Per-worker progress reporting protocol.
//!
//! Each worker owns the write end of one ordered, typed channel; the
//! monitor polls the read ends without blocking. Messages are delivered
//! whole, so a torn report cannot be observed, and channel closure with no
//! pending messages doubles as an implicit death notice.

use tokio::sync::mpsc::{
    self,
    error::TryRecvError,
    unbounded_channel,
};

/// One progress message: work performed since the previous report.
///
/// The reserved pair `(-1, -1)` is the sentinel meaning "this worker failed
/// fatally and will send nothing further".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Iterations completed since the last report, or `-1`.
    pub iterations: i32,
    /// Verification faults detected since the last report, or `-1`.
    pub errors: i32,
}

impl Report {
    pub const SENTINEL: Self = Self {
        iterations: -1,
        errors: -1,
    };

    /// A progress report. Counts are saturated into the wire width.
    #[must_use]
    pub fn progress(iterations: u64, errors: u64) -> Self {
        Self {
            iterations: iterations.min(i32::MAX as u64) as i32,
            errors: errors.min(i32::MAX as u64) as i32,
        }
    }

    /// Whether this message signals fatal worker death. Any negative
    /// iteration count is read as the sentinel.
    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.iterations < 0
    }
}

/// The monitor went away. Expected during shutdown races; the writer stops
/// reporting and proceeds to exit.
#[derive(Debug, thiserror::Error)]
#[error("report channel peer is gone")]
pub struct PeerGone;

/// Write end, owned exclusively by one worker. Dropping it closes the
/// channel, which is the worker's done-signal.
pub struct ReportSender {
    tx: mpsc::UnboundedSender<Report>,
}

impl ReportSender {
    pub fn send(&self, report: Report) -> Result<(), PeerGone> {
        self.tx.send(report).map_err(|_| PeerGone)
    }

    /// Best effort: the peer being gone is irrelevant to a dying worker.
    pub fn send_sentinel(&self) {
        let _ = self.tx.send(Report::SENTINEL);
    }
}

/// What one non-blocking poll of the read end produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPoll {
    /// A whole report was available.
    Report(Report),
    /// Nothing pending right now; the worker is still connected.
    Empty,
    /// The write end closed and no messages remain.
    Closed,
}

/// Read end, owned by the monitor.
pub struct ReportReceiver {
    rx: mpsc::UnboundedReceiver<Report>,
}

impl ReportReceiver {
    /// Non-blocking poll. Delivery is in the order the worker sent;
    /// a sentinel is always observed before `Closed`.
    pub fn poll(&mut self) -> ChannelPoll {
        match self.rx.try_recv() {
            Ok(report) => ChannelPoll::Report(report),
            Err(TryRecvError::Empty) => ChannelPoll::Empty,
            Err(TryRecvError::Disconnected) => ChannelPoll::Closed,
        }
    }
}

/// Create one report channel: exactly one writer (the worker) and one
/// reader (the monitor).
#[must_use]
pub fn channel() -> (ReportSender, ReportReceiver) {
    let (tx, rx) = unbounded_channel();
    (ReportSender { tx }, ReportReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_delivered_in_order() {
        let (tx, mut rx) = channel();
        tx.send(Report::progress(10, 0)).unwrap();
        tx.send(Report::progress(20, 1)).unwrap();
        assert_eq!(rx.poll(), ChannelPoll::Report(Report::progress(10, 0)));
        assert_eq!(rx.poll(), ChannelPoll::Report(Report::progress(20, 1)));
        assert_eq!(rx.poll(), ChannelPoll::Empty);
    }

    #[test]
    fn test_sentinel_observed_before_closure() {
        let (tx, mut rx) = channel();
        tx.send_sentinel();
        drop(tx);
        match rx.poll() {
            ChannelPoll::Report(r) => assert!(r.is_sentinel()),
            other => panic!("expected sentinel, got {other:?}"),
        }
        assert_eq!(rx.poll(), ChannelPoll::Closed);
    }

    #[test]
    fn test_closure_without_sentinel() {
        let (tx, mut rx) = channel();
        drop(tx);
        assert_eq!(rx.poll(), ChannelPoll::Closed);
    }

    #[test]
    fn test_writer_classifies_peer_gone() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(tx.send(Report::progress(1, 0)).is_err());
        // Sentinel writes never escalate either.
        tx.send_sentinel();
    }

    #[test]
    fn test_progress_saturates() {
        let r = Report::progress(u64::MAX, 0);
        assert_eq!(r.iterations, i32::MAX);
        assert!(!r.is_sentinel());
    }
}
