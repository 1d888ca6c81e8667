//! Process-wide tracing setup.
//!
//! `RUST_LOG` selects levels (default `info`). `SYNCLINE_LOG_FORMAT=pretty`
//! switches from JSON lines to compact human-readable output.

use crate::{Error, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Result<Self> {
        match std::env::var("SYNCLINE_LOG_FORMAT") {
            Err(_) => Ok(Self::Json),
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "" | "json" => Ok(Self::Json),
                "pretty" | "compact" => Ok(Self::Pretty),
                other => Err(Error::InvalidInput(format!(
                    "SYNCLINE_LOG_FORMAT has an invalid value: {other}"
                ))),
            },
        }
    }
}

#[tracing::instrument(level = "info", skip_all)]
pub fn init_tracing_from_env() -> Result<()> {
    init_tracing(LogFormat::from_env()?)
}

pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let init = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    init.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}
