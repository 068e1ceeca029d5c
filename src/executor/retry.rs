//! Bounded retry of retriable failures with a fixed sleep between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::EtlResult;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: usize,
    /// Pause between attempts
    pub sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            sleep: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds, fails non-retriably, or attempts run out.
///
/// Only errors classified as retriable are retried; anything else is
/// returned on first sight. Each retry is logged with its attempt number.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retriable error.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use eth_stream_etl::executor::{execute_with_retries, RetryPolicy};
/// use eth_stream_etl::error::EtlResult;
///
/// # async fn example() -> EtlResult<()> {
/// let policy = RetryPolicy { max_attempts: 3, sleep: Duration::ZERO };
/// let value = execute_with_retries("answer", policy, || async { Ok::<_, _>(42) }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn execute_with_retries<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> EtlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EtlResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < max_attempts => {
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Retriable failure, retrying"
                );
                tokio::time::sleep(policy.sleep).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
