//! Bounded exponential backoff for control-plane calls
//!
//! Only transient errors (and call timeouts) are retried. Permanent errors and
//! conflicts return immediately. A cancellation request stops retrying after the
//! attempt in progress; it never interrupts that attempt.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::control::ControlError;

/// Retry parameters. Defaults: 3 attempts, 2 s initial delay, doubling, 30 s cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Retry `attempts` times with no waiting in between
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Result of a retried call together with how many attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ControlError>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts,
/// or cancellation is requested.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &watch::Receiver<bool>,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ControlError>>,
{
    let mut cancel = cancel.clone();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) => e,
        };

        if !err.is_transient() || attempt >= max_attempts || *cancel.borrow() {
            if err.is_transient() {
                error!(
                    operation = %label,
                    attempt = attempt,
                    error = %err,
                    "Operation failed after retries"
                );
            }
            return Attempted {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.delay_after(attempt);
        warn!(
            operation = %label,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            changed = cancel.changed() => {
                // Sender gone: nobody can cancel any more, finish the wait
                if changed.is_err() {
                    sleep.await;
                }
            }
        }
        if *cancel.borrow() {
            return Attempted {
                result: Err(err),
                attempts: attempt,
            };
        }
    }
}
