//! One-shot timers which deliver their expiry as a message.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing_futures::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// A follower or candidate heard nothing from a leader for too long.
    Election,
    /// Time to check whether the log is long enough to take a snapshot.
    SnapshotCheck,
}

/// The expiry of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tick {
    pub(crate) kind: TimerKind,
    pub(crate) epoch: u64,
}

/// A timer armed with an epoch.
///
/// On expiry it sends a `Tick` carrying the epoch to its receiver. Dropping the timer cancels it,
/// but a tick may already be queued: the receiver drops any tick whose epoch is not that of the
/// timer it currently holds.
pub(crate) struct Timer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn start<T>(kind: TimerKind, epoch: u64, after: Duration, tx: mpsc::UnboundedSender<T>) -> Self
    where T: From<Tick> + Send + 'static {
        let handle = tokio::spawn(
            async move {
                sleep(after).await;
                // The receiver is gone only when the node is shutting down.
                let _ = tx.send(Tick { kind, epoch }.into());
            }
            .instrument(tracing::trace_span!("timer", ?kind, epoch)),
        );
        Self { epoch, handle }
    }

    pub(crate) fn is_current(&self, tick: &Tick) -> bool {
        self.epoch == tick.epoch
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A source of increasing timer epochs.
#[derive(Debug, Default)]
pub(crate) struct Epochs {
    last: u64,
}

impl Epochs {
    pub(crate) fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}
