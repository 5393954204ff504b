use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::{BridgeError, Result};

/// Bounded exponential backoff: `max_attempts` tries, sleeping `base_delay`
/// after the first failure and doubling after each further one.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Runs `attempt_fn` under the policy. Non-retryable errors short-circuit;
/// the final retryable failure is surfaced as `BridgeError::Connection`.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                return Err(exhausted(err, policy.max_attempts));
            }
            Err(err) => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "connect attempt failed, backing off");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

fn exhausted(err: BridgeError, attempts: u32) -> BridgeError {
    match err {
        BridgeError::Io(source) => BridgeError::Connection { attempts, source },
        BridgeError::Connection { source, .. } => BridgeError::Connection { attempts, source },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn io_err() -> BridgeError {
        BridgeError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[tokio::test(start_paused = true)]
    async fn four_failures_then_success_with_doubling_delays() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = with_backoff(RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                Err(io_err())
            } else {
                Ok(7u32)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 100 + 200 + 400 + 800 ms of backoff in virtual time.
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let calls = AtomicU32::new(0);

        let err = with_backoff(RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(io_err())
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(err, BridgeError::Connection { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn security_errors_are_never_retried() {
        let calls = AtomicU32::new(0);

        let err = with_backoff(RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BridgeError::Security {
                expected: "sha256:aa".into(),
                presented: "sha256:bb".into(),
            })
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, BridgeError::Security { .. }));
    }
}
