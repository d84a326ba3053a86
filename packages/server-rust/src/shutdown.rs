//! Factory run state, the shutdown broadcast, and outcome-report tracking.
//!
//! The run state lives in one watch channel: every loop selects on a
//! [`ShutdownSignal`] that resolves once the state reaches `Draining`.
//! Outcome reports hold a [`ReportGuard`] while in transit; the last guard to
//! drop wakes [`ShutdownController::wait_for_drain`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Lifecycle of a running factory, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    /// Mailboxes are being bound and workers started.
    Starting,
    /// Accepting intake.
    Ready,
    /// Shutdown triggered; loops are exiting and reports are flushing.
    Draining,
    /// Every tracked report has completed.
    Stopped,
}

#[derive(Debug, Default)]
struct Reports {
    in_flight: AtomicU64,
    idle: Notify,
}

/// Broadcasts shutdown and tracks in-transit outcome reports.
#[derive(Debug)]
pub struct ShutdownController {
    state: watch::Sender<RunState>,
    reports: Arc<Reports>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(RunState::Starting),
            reports: Arc::new(Reports::default()),
        }
    }

    /// `Starting -> Ready`. No effect once shutdown has begun.
    pub fn set_ready(&self) {
        self.advance(RunState::Ready);
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// A fresh signal. Signals taken after `trigger()` observe it immediately.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.state.subscribe(),
        }
    }

    /// Moves to `Draining` and wakes every signal holder.
    pub fn trigger(&self) {
        self.advance(RunState::Draining);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.state() >= RunState::Draining
    }

    // send_if_modified stores the value even with no receivers subscribed.
    fn advance(&self, to: RunState) {
        self.state.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Tracks one outcome report until the guard drops.
    #[must_use]
    pub fn report_guard(&self) -> ReportGuard {
        self.reports.in_flight.fetch_add(1, Ordering::AcqRel);
        ReportGuard {
            reports: Arc::clone(&self.reports),
        }
    }

    #[must_use]
    pub fn reports_in_flight(&self) -> u64 {
        self.reports.in_flight.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every tracked report to finish.
    ///
    /// Returns `true` and moves to `Stopped` once none are left; returns
    /// `false` if reports are still in transit at the deadline.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.reports.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a guard dropped in between still wakes us.
            idle.as_mut().enable();

            if self.reports_in_flight() == 0 {
                self.advance(RunState::Stopped);
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<RunState>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() >= RunState::Draining
    }

    /// Resolves once shutdown is triggered, or the controller is dropped.
    ///
    /// Cancel-safe, so it can sit in a `select!` loop.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() >= RunState::Draining {
                return;
            }
            // The controller is gone, which counts as shutdown.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Releases one in-flight report on drop, including on panic unwind.
#[derive(Debug)]
pub struct ReportGuard {
    reports: Arc<Reports>,
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if self.reports.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.reports.idle.notify_waiters();
        }
    }
}
