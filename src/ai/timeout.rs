//! Timeouts
//!
//! - [`with_timeout`]: bound a single async operation
//! - [`JobDeadline`]: soft/hard job budget checked cooperatively at stage
//!   boundaries. In-flight provider calls are never interrupted by it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::types::{ForgeError, Result};

/// Execute an async operation with a timeout
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ForgeError::timeout(operation_name, timeout)),
    }
}

/// Soft/hard elapsed-time budget for one job
#[derive(Debug)]
pub struct JobDeadline {
    started: Instant,
    soft: Duration,
    hard: Duration,
    warned: AtomicBool,
}

impl JobDeadline {
    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self::starting_at(Instant::now(), soft, hard)
    }

    pub fn starting_at(started: Instant, soft: Duration, hard: Duration) -> Self {
        Self {
            started,
            soft,
            hard,
            warned: AtomicBool::new(false),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Check the budget at a stage boundary.
    ///
    /// Past the soft limit a warning is logged once; past the hard limit the
    /// stage must abort.
    pub fn check(&self, stage: &str) -> Result<()> {
        let elapsed = self.elapsed();
        if elapsed >= self.hard {
            return Err(ForgeError::timeout(stage, self.hard));
        }
        if elapsed >= self.soft && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                stage,
                elapsed_secs = elapsed.as_secs(),
                "Job passed its soft timeout of {:?}",
                self.soft
            );
        }
        Ok(())
    }
}
