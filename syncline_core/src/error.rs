use std::error::Error as StdError;
use std::fmt;

/// Where an adapter or destination error happened.
///
/// Carried on every adapter-level error so a failed run can be diagnosed from
/// the error alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub connector_name: String,
    pub connection_id: Option<String>,
    pub stream_name: Option<String>,
}

impl ErrorContext {
    pub fn new(connector_name: impl Into<String>) -> Self {
        Self {
            connector_name: connector_name.into(),
            connection_id: None,
            stream_name: None,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_stream(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = Some(stream_name.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector={}", self.connector_name)?;
        if let Some(id) = &self.connection_id {
            write!(f, " connection={id}")?;
        }
        if let Some(stream) = &self.stream_name {
            write!(f, " stream={stream}")?;
        }
        Ok(())
    }
}

/// Common error type for `syncline_core`.
///
/// Concrete backends (HTTP clients, databases) should preserve the underlying
/// error chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Rate limit, 5xx, timeout. Retried inside the adapter.
    #[error("transient adapter error ({context}): {message}")]
    AdapterTransient {
        context: ErrorContext,
        message: String,
    },

    /// Invalid credentials, revoked access, exhausted retries. Terminates the run.
    #[error("adapter failed ({context}): {message}")]
    AdapterFatal {
        context: ErrorContext,
        message: String,
    },

    /// A commit batch could not be written. The batch is kept for the retry.
    #[error("destination flush failed ({context}): {message}")]
    DestinationFlush {
        context: ErrorContext,
        message: String,
    },

    #[error("connect flow failed for '{connector_name}': {message}")]
    ConnectFlow {
        connector_name: String,
        message: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "syncline.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn transient(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::AdapterTransient {
            context,
            message: message.into(),
        }
    }

    pub fn fatal(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::AdapterFatal {
            context,
            message: message.into(),
        }
    }

    pub fn flush(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::DestinationFlush {
            context,
            message: message.into(),
        }
    }

    pub fn connect_flow(connector_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFlow {
            connector_name: connector_name.into(),
            message: message.into(),
        }
    }

    /// Worth retrying: the adapter may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AdapterTransient { .. })
    }

    /// Errors that a run can recover from by re-running from the last committed cursor.
    pub fn is_retryable_run_failure(&self) -> bool {
        matches!(
            self,
            Self::AdapterTransient { .. } | Self::DestinationFlush { .. }
        )
    }

    /// Errors surfaced to operators as "sync failed".
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            Self::AdapterFatal { .. } | Self::DestinationFlush { .. }
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::AdapterTransient { context, .. }
            | Self::AdapterFatal { context, .. }
            | Self::DestinationFlush { context, .. } => Some(context),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
