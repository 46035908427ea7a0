//! Exponential backoff around control-plane calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::EngineError;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Storage calls: 3 retries from 250ms, doubling.
    pub fn persistence() -> Self {
        Self {
            max_retries: Some(3),
            base_delay: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Clock delivery: retried until it lands, capped at one minute between tries.
    pub fn clock() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_millis(200),
            factor: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn allows(&self, retry: u32) -> bool {
        self.max_retries.is_none_or(|max| retry < max)
    }
}

/// Retry `f` while it fails with a retryable persistence error.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, f: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    retry_with(policy, operation, EngineError::is_transient, f).await
}

/// Retry `f` while `should_retry` accepts the error and the policy has budget left.
pub async fn retry_with<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    should_retry: P,
    mut f: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    P: Fn(&EngineError) -> bool,
{
    let mut retry: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && policy.allows(retry) => {
                let backoff = policy.delay_for(retry);
                warn!(
                    retry,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "{operation} failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                retry = retry.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PersistenceError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::persistence();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));

        let clock = RetryPolicy::clock();
        assert_eq!(clock.delay_for(0), Duration::from_millis(200));
        assert_eq!(clock.delay_for(100), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_budget_runs_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), EngineError> = retry_transient(&RetryPolicy::persistence(), "lookup", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PersistenceError::retryable("lookup", "busy").into())
            }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        // first attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let value = retry_transient(&RetryPolicy::persistence(), "lookup", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PersistenceError::retryable("lookup", "busy").into())
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_escalate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), EngineError> = retry_transient(&RetryPolicy::persistence(), "save", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PersistenceError::permanent("save", "corrupt").into())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
