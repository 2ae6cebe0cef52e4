// src/retry.rs
//! Bounded exponential backoff for any fallible async operation.
//!
//! `RetryPolicy` is a plain value; each call site owns its own copy. The delay
//! before retry `k` (0-indexed attempt that just failed) is
//! `min(base_delay * 2^k, max_delay)`, and there is no sleep after the final
//! attempt. When every attempt fails the last error is returned wrapped in
//! [`HarvestError::Exhausted`] with the subsystem tag of the call site.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ErrorKind, HarvestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The sleeps a fully failing run performs, in order.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts.max(1) - 1)
            .map(|k| self.delay_for(k))
            .collect()
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// The policy leaves no state behind; `op` must be idempotent across retries.
    pub async fn execute<T, F, Fut>(
        &self,
        kind: ErrorKind,
        label: &str,
        mut op: F,
    ) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(target: "retry", op = label, attempt = attempt + 1, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempt + 1 < attempts {
                        let delay = self.delay_for(attempt);
                        warn!(
                            target: "retry",
                            op = label,
                            %kind,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            error = %format!("{e:#}"),
                            next_delay_ms = delay.as_millis() as u64,
                            "attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            target: "retry",
                            op = label,
                            %kind,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            error = %format!("{e:#}"),
                            "final attempt failed"
                        );
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(HarvestError::Exhausted {
            kind,
            attempts,
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("operation never ran")),
        })
    }
}

/// Bound an external call. Expiry is reported as a transient I/O error so it
/// feeds into the same retry policy as any other hiccup.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(HarvestError::TransientIo(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy::new(6, Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(
            p.delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        // Shift overflow saturates at the cap.
        assert_eq!(p.delay_for(64), Duration::from_secs(10));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let p = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(p.max_attempts, 1);
        assert!(p.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_two_then_four_seconds_and_returns_last_error() {
        let p = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let start = Instant::now();

        let res: Result<(), HarvestError> = p
            .execute(ErrorKind::Network, "test", || {
                let calls = calls.clone();
                let stamps = stamps.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    stamps.lock().unwrap().push(start.elapsed());
                    Err(anyhow::anyhow!("boom {n}"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps[1] - stamps[0], Duration::from_secs(2));
        assert_eq!(stamps[2] - stamps[1], Duration::from_secs(4));
        // No sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(6));

        match res {
            Err(HarvestError::Exhausted { kind, attempts, source }) => {
                assert_eq!(kind, ErrorKind::Network);
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "boom 3");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_success() {
        let p = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let out = p
            .execute(ErrorKind::Browser, "flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("first fails")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_transient_io() {
        let res: anyhow::Result<()> = with_timeout(Duration::from_millis(50), "fetch", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = res.unwrap_err();
        let typed = err.downcast_ref::<HarvestError>().expect("typed error");
        assert!(matches!(typed, HarvestError::TransientIo(m) if m.contains("fetch timed out")));
    }
}
