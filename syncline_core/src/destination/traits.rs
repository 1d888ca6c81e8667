use crate::Result;
use crate::error::ErrorContext;
use crate::models::Connection;
use crate::retry::RetryPolicy;
use crate::sync::link::BoxLink;
use crate::sync::operation::{ConnectionUpdate, DataOp, StateUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// When a destination may flush without waiting for the source's commit.
///
/// With `max_records: None` (the default) batches grow until the next commit,
/// so batch boundaries are exactly the source's commit boundaries. With a cap,
/// data records are flushed early once the cap is reached; state and
/// connection updates still wait for the real commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPolicy {
    pub max_records: Option<usize>,
}

/// Everything a destination needs for one run.
#[derive(Debug, Clone)]
pub struct DestinationContext {
    pub connection: Connection,
    pub config: serde_json::Value,
    pub policy: BatchPolicy,
    pub retry: RetryPolicy,
}

impl DestinationContext {
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::new(self.connection.connector_name.clone())
            .with_connection(self.connection.id.to_string())
    }
}

/// Everything buffered since the last successful flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub data: Vec<DataOp>,
    pub connection_updates: Vec<ConnectionUpdate>,
    pub state_updates: Vec<StateUpdate>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.connection_updates.is_empty() && self.state_updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len() + self.connection_updates.len() + self.state_updates.len()
    }
}

/// Writes one batch atomically: a single network call or one transaction.
///
/// A flush either applies the whole batch or returns an error having applied
/// none of it.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    async fn flush(&self, batch: &Batch) -> Result<()>;
}

/// A connector's loading side: builds the link that sits at the end of a pipeline.
pub trait DestinationAdapter: Send + Sync {
    fn connector_name(&self) -> &'static str;

    fn destination_sync(&self, ctx: DestinationContext) -> Result<BoxLink>;
}
