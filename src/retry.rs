//! Bounded retry with a fixed delay between attempts.
//!
//! One policy object serves every remote call site — OCR requests,
//! translation requests, object uploads. Only `max_attempts` and `delay`
//! differ between them. The policy owns no client and no state beyond the
//! two knobs: the action to retry is passed in per call, so the same policy
//! can wrap a chat request, an upload-then-verify sequence, or another
//! retrying call (the OCR stage nests two layers this way).
//!
//! ## Delay
//!
//! The delay is fixed, not exponential. Per-stage worker pools are small
//! (one to four workers) and provider rate limits are the usual cause of
//! failures, so a constant pause is enough to let the provider recover.

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and inter-attempt delay for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always ≥ 1.
    pub max_attempts: u32,
    /// Pause between two consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn worst_case_delay(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Run `action` until it succeeds or the attempt budget is spent.
    ///
    /// `action` receives the 1-based attempt number. Every error is treated
    /// as transient; a successful result is returned as-is even if its
    /// content is empty. After the last failed attempt the error is wrapped
    /// in [`RemoteError::ExhaustedRetries`].
    ///
    /// `label` identifies the unit in log lines (object name, image URL,
    /// chunk ordinal).
    pub async fn run<T, F, Fut>(&self, label: &str, mut action: F) -> Result<T, RemoteError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match action(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{}: succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        "{}: attempt {}/{} failed: {}",
                        label, attempt, max_attempts, e
                    );
                    if attempt >= max_attempts {
                        return Err(RemoteError::ExhaustedRetries {
                            attempts: max_attempts,
                            last: Box::new(e),
                        });
                    }
                }
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            attempt += 1;
        }
    }
}
