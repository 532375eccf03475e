//! Retry with exponential backoff for remote transfers.
//!
//! Only [`TransferErrorKind::Retryable`] failures are retried. A fatal error
//! ends the attempt loop immediately so the caller can abort the run.

use crate::cancel::CancellationToken;
use crate::remote::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backoff settings for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded
    Success { value: T, attempts: u32 },
    /// Retries ran out, or a fatal error stopped them
    Exhausted { last_error: TransferError, attempts: u32 },
    /// Cancellation was requested before the next attempt
    Cancelled { attempts: u32 },
}

impl<T> RetryOutcome<T> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_backoff`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ns = self.initial_backoff.as_nanos() as f64;
        let max_ns = self.max_backoff.as_nanos() as f64;
        let computed = base_ns * self.multiplier.max(1.0).powi(retry.min(64) as i32);
        Duration::from_nanos(computed.min(max_ns) as u64)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Blocks the calling thread
    /// while backing off.
    pub fn run<T, F>(&self, cancel: Option<&CancellationToken>, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> TransferResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return RetryOutcome::Cancelled { attempts: attempt };
            }
            attempt += 1;

            match op(attempt) {
                Ok(value) => return RetryOutcome::Success { value, attempts: attempt },
                Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                    return RetryOutcome::Exhausted {
                        last_error: e,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let delay = self.delay_for(attempt - 1);
                    debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
