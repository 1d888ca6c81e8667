//! Bounded retry with exponential backoff for adapter network calls.

use crate::error::ErrorContext;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call. Always >= 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Applied to each call, never to the run as a whole.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.min(31);
        let factor = 1u32 << shift;
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
///
/// Timeouts count as transient failures. Exhausting the attempts turns the
/// last transient error into `AdapterFatal`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    context: &ErrorContext,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match policy.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call()).await {
                Ok(res) => res,
                Err(_) => Err(Error::transient(
                    context.clone(),
                    format!("call timed out after {}ms", limit.as_millis()),
                )),
            },
            None => call().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt - 1);
                tracing::warn!(
                    %context,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient adapter error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::fatal(
                    context.clone(),
                    format!("retries exhausted after {attempt} attempts: {e}"),
                ));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map an unsuccessful HTTP status to the adapter error taxonomy.
///
/// 408, 429 and 5xx are transient; everything else (bad credentials, revoked
/// access, malformed requests) is fatal.
pub fn error_for_status(context: &ErrorContext, status: u16, body: &str) -> Error {
    let snippet: String = body.chars().take(256).collect();
    let message = format!("http status {status}: {snippet}");
    match status {
        408 | 429 | 500..=599 => Error::transient(context.clone(), message),
        _ => Error::fatal(context.clone(), message),
    }
}
