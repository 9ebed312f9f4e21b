//! One-shot wake-up at a bill's period end.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, Sleep};

use billflow_core::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    Armed,
    Fired,
    Cancelled,
}

/// Arms deadlines against wall-clock period ends.
#[derive(Clone)]
pub struct DeadlineScheduler {
    clock: Arc<dyn Clock>,
}

impl DeadlineScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Arm for `due_at`. The wait is `due_at - now` computed once, here; a due time
    /// already in the past fires on the first poll.
    pub fn arm(&self, due_at: DateTime<Utc>) -> Deadline {
        let wait = (due_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        Deadline::new(due_at, wait)
    }

    /// Arm relative to now.
    pub fn arm_after(&self, wait: Duration) -> Deadline {
        let due_at = self.clock.now() + chrono::Duration::from_std(wait).unwrap_or_default();
        Deadline::new(due_at, wait)
    }
}

/// A pending wake-up owned by one controller.
///
/// [`Deadline::elapsed`] is cancel-safe, so it can sit in a `select!` loop and be
/// polled again after another branch wins.
#[derive(Debug)]
pub struct Deadline {
    due_at: DateTime<Utc>,
    state: DeadlineState,
    sleep: Pin<Box<Sleep>>,
}

impl Deadline {
    fn new(due_at: DateTime<Utc>, wait: Duration) -> Self {
        Self {
            due_at,
            state: DeadlineState::Armed,
            sleep: Box::pin(tokio::time::sleep_until(Instant::now() + wait)),
        }
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    pub fn state(&self) -> DeadlineState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == DeadlineState::Armed
    }

    /// Remove the pending wake-up. Returns `false` (and changes nothing) if it already
    /// fired or was cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.is_armed() {
            self.state = DeadlineState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Wait for the deadline. Never resolves unless armed.
    pub async fn elapsed(&mut self) {
        if !self.is_armed() {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.state = DeadlineState::Fired;
    }
}
