//! Timeout ticker for the router loop.
//!
//! Consensus keeps at most one pending timeout: scheduling a new ticket
//! cancels the previous one, and the consensus state drops any tick whose
//! (height, round, step) is stale by the time it fires.

use beacon_core::TimeoutInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Single-slot timer that delivers [`TimeoutInfo`] tickets on a channel.
pub struct TimeoutTicker {
    tock_tx: mpsc::Sender<TimeoutInfo>,
    pending: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    /// Create a ticker and the channel its ticks arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (tock_tx, tock_rx) = mpsc::channel(capacity);
        (
            TimeoutTicker {
                tock_tx,
                pending: None,
            },
            tock_rx,
        )
    }

    /// Arm the ticker. Any previously scheduled ticket is cancelled.
    pub fn schedule(&mut self, info: TimeoutInfo) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        let tock_tx = self.tock_tx.clone();
        debug!(
            height = info.height,
            round = info.round,
            step = %info.step,
            duration = ?info.duration,
            "scheduled timeout"
        );
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(info.duration).await;
            trace!(height = info.height, round = info.round, "timeout fired");
            let _ = tock_tx.send(info).await;
        }));
    }

    /// Cancel the pending ticket, if any.
    pub fn stop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Step;
    use std::time::Duration;

    fn ticket(round: u32, duration_ms: u64) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(duration_ms),
            height: 1,
            round,
            step: Step::Propose,
        }
    }

    #[tokio::test]
    async fn ticker_fires() {
        let (mut ticker, mut tock_rx) = TimeoutTicker::new(4);
        ticker.schedule(ticket(0, 5));
        let info = tokio::time::timeout(Duration::from_millis(200), tock_rx.recv())
            .await
            .expect("tick in time")
            .expect("channel open");
        assert_eq!(info.round, 0);
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_ticket() {
        let (mut ticker, mut tock_rx) = TimeoutTicker::new(4);
        ticker.schedule(ticket(0, 5_000));
        ticker.schedule(ticket(1, 5));
        let info = tokio::time::timeout(Duration::from_millis(200), tock_rx.recv())
            .await
            .expect("tick in time")
            .expect("channel open");
        assert_eq!(info.round, 1, "the stale ticket must have been cancelled");
    }
}
