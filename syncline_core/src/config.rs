use crate::destination::BatchPolicy;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::time::Duration;

/// Engine-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Coordinator-level attempts per run (re-runs from the last committed cursor).
    pub max_run_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,

    /// Attempts per adapter network call before the error becomes fatal.
    pub adapter_max_attempts: u32,
    /// Timeout for a single adapter network call.
    pub request_timeout_ms: u64,

    /// Optional cap on buffered data records between commits.
    /// `None` means batches grow until the source's next commit.
    pub max_batch_records: Option<usize>,
    /// Operations allowed in flight between source and destination.
    pub buffer_capacity: usize,

    /// Optional shared secret for inbound webhook signature verification.
    /// If `None`, signatures are not enforced.
    pub webhook_signing_secret: Option<String>,
    pub max_webhook_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_run_attempts: 3,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            adapter_max_attempts: 5,
            request_timeout_ms: 30_000,
            max_batch_records: None,
            buffer_capacity: 256,
            webhook_signing_secret: None,
            max_webhook_payload_bytes: 1_000_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Read `SYNCLINE_*` variables on top of the defaults and validate the result.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            max_run_attempts: env_parse("SYNCLINE_MAX_RUN_ATTEMPTS")?.unwrap_or(d.max_run_attempts),
            retry_backoff_base_ms: env_parse("SYNCLINE_RETRY_BACKOFF_BASE_MS")?
                .unwrap_or(d.retry_backoff_base_ms),
            retry_backoff_max_ms: env_parse("SYNCLINE_RETRY_BACKOFF_MAX_MS")?
                .unwrap_or(d.retry_backoff_max_ms),
            adapter_max_attempts: env_parse("SYNCLINE_ADAPTER_MAX_ATTEMPTS")?
                .unwrap_or(d.adapter_max_attempts),
            request_timeout_ms: env_parse("SYNCLINE_REQUEST_TIMEOUT_MS")?
                .unwrap_or(d.request_timeout_ms),
            max_batch_records: env_parse("SYNCLINE_MAX_BATCH_RECORDS")?,
            buffer_capacity: env_parse("SYNCLINE_BUFFER_CAPACITY")?.unwrap_or(d.buffer_capacity),
            webhook_signing_secret: std::env::var("SYNCLINE_WEBHOOK_SIGNING_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            max_webhook_payload_bytes: env_parse("SYNCLINE_MAX_WEBHOOK_PAYLOAD_BYTES")?
                .unwrap_or(d.max_webhook_payload_bytes),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.max_run_attempts == 0 {
            return Err(Error::InvalidInput("max_run_attempts must be > 0".to_string()));
        }
        if self.adapter_max_attempts == 0 {
            return Err(Error::InvalidInput(
                "adapter_max_attempts must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_base_ms == 0 {
            return Err(Error::InvalidInput(
                "retry_backoff_base_ms must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(Error::InvalidInput(
                "retry_backoff_max_ms must be >= retry_backoff_base_ms".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_batch_records == Some(0) {
            return Err(Error::InvalidInput(
                "max_batch_records must be > 0 when set".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::InvalidInput("buffer_capacity must be > 0".to_string()));
        }
        if self.max_webhook_payload_bytes == 0 {
            return Err(Error::InvalidInput(
                "max_webhook_payload_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff between coordinator attempts: base * 2^retry, capped.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        self.run_retry_policy().backoff(retry)
    }

    pub fn run_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_run_attempts,
            base_backoff: Duration::from_millis(self.retry_backoff_base_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
            call_timeout: None,
        }
    }

    /// Policy handed to source and destination adapters for their network calls.
    pub fn adapter_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.adapter_max_attempts,
            base_backoff: Duration::from_millis(self.retry_backoff_base_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
            call_timeout: Some(Duration::from_millis(self.request_timeout_ms)),
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_records: self.max_batch_records,
        }
    }
}
