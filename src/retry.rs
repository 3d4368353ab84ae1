// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Exponential backoff with jitter, and the transient/permanent error split.

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{hub_error, HubError};

/// How a failure should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: connection loss, timeouts, 5xx, 429, truncated bodies.
    Transient,
    /// Surface immediately: auth, not-found, bad request, disk space, overflow.
    Permanent,
}

/// Classify an error from anywhere in the pipeline.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    if let Some(hub) = hub_error(err) {
        return if hub.is_transient() { ErrorClass::Transient } else { ErrorClass::Permanent };
    }

    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
                return ErrorClass::Transient;
            }
            if let Some(status) = e.status() {
                if status.is_server_error() || status.as_u16() == 429 {
                    return ErrorClass::Transient;
                }
            }
            return ErrorClass::Permanent;
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return match e.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::Interrupted => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            };
        }
    }

    ErrorClass::Permanent
}

/// Backoff schedule and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform perturbation of each delay, as a fraction of it (0.0 disables jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// `min(base × 2^(attempt-1), max)`; attempt numbering starts at 1.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, jittered when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        delay.mul_f64(1.0 + offset)
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget runs out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// unchanged. Cancellation is checked before every attempt and aborts the
    /// backoff sleep with [`HubError::Cancelled`].
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(HubError::Cancelled.into());
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if classify(&err) == ErrorClass::Permanent || attempt > self.max_retries {
                return Err(err);
            }

            let wait = self.delay(attempt);
            tracing::warn!(
                attempt,
                max_retries = self.max_retries,
                wait_ms = wait.as_millis() as u64,
                "Transient failure, retrying: {:#}",
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(HubError::Cancelled.into()),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_delay_without_jitter() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_huge_attempt_saturates() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_varies_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.25);
        let base = Duration::from_secs(4);
        let low = base.mul_f64(0.75);
        let high = base.mul_f64(1.25);

        let delays: Vec<Duration> = (0..10).map(|_| policy.delay(3)).collect();
        for d in &delays {
            assert!(*d >= low && *d <= high, "delay {:?} outside [{:?}, {:?}]", d, low, high);
        }
        let distinct: HashSet<_> = delays.iter().collect();
        assert!(distinct.len() > 1, "jitter produced identical delays");
    }

    #[test]
    fn test_classify() {
        let transient = anyhow::Error::new(HubError::Timeout("read".into()));
        assert_eq!(classify(&transient), ErrorClass::Transient);

        let auth = anyhow::Error::new(HubError::AuthenticationRequired("401".into()));
        assert_eq!(classify(&auth), ErrorClass::Permanent);

        let reset = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&reset), ErrorClass::Transient);

        let disk = anyhow::Error::new(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(classify(&disk), ErrorClass::Permanent);

        assert_eq!(classify(&anyhow::anyhow!("mystery")), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);

        let result = fast_policy(3)
            .run(&cancel, |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HubError::Network("connection lost".into()).into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);

        let err = fast_policy(5)
            .run(&cancel, |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HubError::NotFound("org/missing".into()).into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub_error(&err), Some(&HubError::NotFound("org/missing".into())));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let cancel = CancellationToken::new();
        let err = fast_policy(2)
            .run(&cancel, |attempt| async move {
                Err::<(), _>(HubError::Network(format!("attempt {}", attempt)).into())
            })
            .await
            .unwrap_err();

        assert_eq!(hub_error(&err), Some(&HubError::Network("attempt 3".into())));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = policy
            .run(&cancel, |_| async { Err::<(), _>(HubError::Timeout("slow".into()).into()) })
            .await
            .unwrap_err();
        assert_eq!(hub_error(&err), Some(&HubError::Cancelled));
    }
}
