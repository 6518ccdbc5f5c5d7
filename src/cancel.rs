//! Cooperative cancellation and deadlines.
//!
//! Every suspending call in the pipeline (LLM, Docker, smoke HTTP, pattern
//! store) polls a shared `CancelToken` at its boundary; iteration loops poll
//! it once per iteration. Cancellation is cooperative: nothing is killed
//! mid-write, in-flight repair iterations roll back, and partial metrics are
//! flushed by the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline error carrying how long the work actually ran.
#[derive(Debug, Clone)]
pub struct DeadlineError {
    pub deadline: Duration,
    pub elapsed: Duration,
}

impl std::fmt::Display for DeadlineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "deadline of {:?} exceeded (ran for {:?})",
            self.deadline, self.elapsed
        )
    }
}

impl std::error::Error for DeadlineError {}

/// Shared cancellation token with an optional overall deadline.
///
/// Cloning shares the underlying flag, so a token handed to a worker pool
/// observes cancellation requested anywhere.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    started: Instant,
    deadline: Option<Duration>,
}

impl CancelToken {
    pub fn new(deadline: Option<Duration>) -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            deadline,
        }
    }

    /// Token with no deadline.
    pub fn unbounded() -> Self {
        CancelToken::new(None)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Poll at a suspension point or iteration boundary. Marks the token
    /// cancelled when the deadline has passed so later polls agree.
    pub fn check(&self) -> Result<(), DeadlineError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(DeadlineError {
                deadline: self.deadline.unwrap_or(Duration::ZERO),
                elapsed: self.started.elapsed(),
            });
        }
        if let Some(deadline) = self.deadline {
            let elapsed = self.started.elapsed();
            if elapsed > deadline {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(DeadlineError { deadline, elapsed });
            }
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Remaining time before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_sub(self.started.elapsed()))
    }

    /// Child token sharing this token's flag but with its own, tighter
    /// deadline (component-local deadlines per the concurrency model).
    pub fn child(&self, deadline: Duration) -> CancelToken {
        CancelToken {
            cancelled: Arc::clone(&self.cancelled),
            started: Instant::now(),
            deadline: Some(deadline),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_observed_by_clones() {
        let token = CancelToken::unbounded();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.check().is_err());
    }

    #[test]
    fn test_deadline_marks_cancelled() {
        let token = CancelToken::new(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert!(token.check().is_err());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_shares_flag() {
        let parent = CancelToken::unbounded();
        let child = parent.child(Duration::from_secs(60));
        parent.cancel();
        assert!(child.check().is_err());
    }
}
