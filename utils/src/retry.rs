use std::{future::Future, time::Duration};

use rand::Rng;

/// Retry policy shared by every remote call of a pass.
///
/// Transient failures (timeouts, connection resets, 5xx) consume the attempt
/// budget with a linear backoff. Rate limiting is waited out separately, with
/// its own cap, so a busy upstream does not burn the transient budget.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    /// Used when a 429 carries no usable Retry-After header.
    pub rate_limit_backoff: Duration,
    pub max_rate_limit_waits: usize,
    /// Upper bound of the random delay added to rate limit waits.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            rate_limit_backoff: Duration::from_secs(5),
            max_rate_limit_waits: 10,
            jitter: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting at all, for tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_backoff: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            max_rate_limit_waits: 10,
            jitter: Duration::ZERO,
        }
    }

    fn transient_delay(&self, attempt: usize) -> Duration {
        self.base_backoff * attempt as u32
    }

    fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or(self.rate_limit_backoff);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of budget.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempts = 0;
        let mut rate_limit_waits = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_rate_limited() {
                rate_limit_waits += 1;
                if rate_limit_waits > self.max_rate_limit_waits {
                    return Err(crate::Error::RetriesExhausted {
                        attempts: attempts + rate_limit_waits,
                        last: Box::new(err),
                    });
                }
                let delay = self.rate_limit_delay(err.retry_after());
                log::warn!("{label}: rate limited, waiting {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }

            attempts += 1;
            if !err.is_transient() {
                return Err(err);
            }
            if attempts >= self.max_attempts {
                return Err(crate::Error::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.transient_delay(attempts);
            log::warn!(
                "{label}: attempt {attempts}/{} failed, retrying in {delay:?} ({err})",
                self.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use url::Url;

    use super::*;

    fn rate_limited() -> crate::Error {
        crate::Error::RateLimited {
            url: Url::parse("https://example.com").unwrap(),
            retry_after: Some(Duration::ZERO),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(crate::Error::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_exhausted() {
        let calls = AtomicUsize::new(0);
        let err = RetryPolicy::immediate(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(crate::Error::Timeout(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = RetryPolicy::immediate(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(crate::Error::AlchemyResponse("bad shape"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::AlchemyResponse(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limits_do_not_consume_attempts() {
        let calls = AtomicUsize::new(0);
        let result = RetryPolicy::immediate(1)
            .run("test", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0..=3 => Err(rate_limited()),
                    _ => Ok("done"),
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_rate_limit_waits_are_capped() {
        let mut policy = RetryPolicy::immediate(3);
        policy.max_rate_limit_waits = 2;
        let err = policy
            .run("test", || async { Err::<(), _>(rate_limited()) })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::RetriesExhausted { .. }));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let delay = policy.rate_limit_delay(Some(Duration::from_secs(1)));
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
        assert_eq!(policy.transient_delay(2), Duration::from_secs(2));
    }
}
