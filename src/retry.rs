use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::UploaderError;

/// How often, how patiently, and on which errors an operation is re-attempted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: fn(&UploaderError) -> bool,
}

impl RetryPolicy {
    /// Exponential backoff on network failures: 1s, 2s, 4s, 5s.
    pub fn transport() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            retryable: UploaderError::is_transient,
        }
    }

    /// Two attempts with a fixed pause, for the final submission calls.
    pub fn finalisation() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(3),
            retryable: is_outage,
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Pause after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

fn is_outage(err: &UploaderError) -> bool {
    match err {
        UploaderError::Transport(_) => true,
        UploaderError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, UploaderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UploaderError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && (policy.retryable)(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after error: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    fn quick(policy: RetryPolicy) -> RetryPolicy {
        policy.with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::transport();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&quick(RetryPolicy::transport()), || async {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(UploaderError::Transport("connection reset".to_string()))
            } else {
                Ok(call)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(&quick(RetryPolicy::transport()), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UploaderError::Transport("timeout".to_string()))
        })
        .await;
        assert_matches!(result, Err(UploaderError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(&quick(RetryPolicy::transport()), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UploaderError::Status {
                status: 403,
                message: "forbidden".to_string(),
            })
        })
        .await;
        assert_matches!(result, Err(UploaderError::Status { status: 403, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalisation_retries_server_errors_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(&quick(RetryPolicy::finalisation()), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UploaderError::Status {
                status: 502,
                message: String::new(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
