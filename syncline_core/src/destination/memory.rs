use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::destination::batcher::batching_link;
use crate::destination::traits::{Batch, BatchWriter, DestinationAdapter, DestinationContext};
use crate::error::ErrorContext;
use crate::sync::link::BoxLink;
use crate::sync::operation::{DataOp, StateUpdate};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    rows: BTreeMap<(String, String), DataOp>,
    flushes: Vec<usize>,
    state_updates: Vec<StateUpdate>,
    fail_next: u32,
}

/// In-process destination for local development, dry runs and unit tests.
///
/// Semantics:
/// - rows are upserted by `(entity_name, id)`, so replays are idempotent
/// - a flush is all-or-nothing (the lock is held for the whole batch)
/// - `fail_next_flushes` makes the next N flushes fail without applying anything
#[derive(Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub const NAME: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_flushes(&self, n: u32) {
        self.inner.lock().await.fail_next = n;
    }

    /// Snapshot of stored rows ordered by `(entity_name, id)`.
    pub async fn rows(&self) -> Vec<DataOp> {
        self.inner.lock().await.rows.values().cloned().collect()
    }

    pub async fn get(&self, entity_name: &str, id: &str) -> Option<DataOp> {
        self.inner
            .lock()
            .await
            .rows
            .get(&(entity_name.to_string(), id.to_string()))
            .cloned()
    }

    /// Data record count of every successful flush, in order.
    pub async fn flush_sizes(&self) -> Vec<usize> {
        self.inner.lock().await.flushes.clone()
    }

    /// Cursors that arrived with successful flushes.
    pub async fn state_updates(&self) -> Vec<StateUpdate> {
        self.inner.lock().await.state_updates.clone()
    }
}

#[async_trait]
impl BatchWriter for MemoryDestination {
    async fn flush(&self, batch: &Batch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::flush(
                ErrorContext::new(Self::NAME),
                "injected flush failure",
            ));
        }
        for op in &batch.data {
            inner
                .rows
                .insert((op.entity_name.clone(), op.id.clone()), op.clone());
        }
        inner.flushes.push(batch.data.len());
        inner.state_updates.extend(batch.state_updates.iter().cloned());
        Ok(())
    }
}

impl DestinationAdapter for MemoryDestination {
    fn connector_name(&self) -> &'static str {
        Self::NAME
    }

    fn destination_sync(&self, ctx: DestinationContext) -> Result<BoxLink> {
        Ok(batching_link(
            Arc::new(self.clone()),
            ctx.policy,
            ctx.error_context(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::traits::BatchPolicy;
    use crate::models::ConnectionId;
    use crate::sync::link::{Link, collect_ops};
    use crate::sync::operation::{SyncOperation, ops_stream};
    use serde_json::json;

    fn ops() -> Vec<SyncOperation> {
        let conn = ConnectionId::from("conn_1");
        vec![
            SyncOperation::Data(DataOp::new("acc1", "account", json!({"v": 1}), conn.clone())),
            SyncOperation::Data(DataOp::new("acc2", "account", json!({"v": 2}), conn.clone())),
            SyncOperation::Commit,
            SyncOperation::Data(DataOp::new("acc1", "account", json!({"v": 3}), conn)),
            SyncOperation::Commit,
        ]
    }

    async fn run(dest: &MemoryDestination) -> Result<Vec<SyncOperation>> {
        let link = batching_link(
            Arc::new(dest.clone()),
            BatchPolicy::default(),
            ErrorContext::new(MemoryDestination::NAME),
        );
        collect_ops(link.apply(ops_stream(ops()))).await
    }

    #[tokio::test]
    async fn replaying_the_same_ops_is_idempotent() {
        let dest = MemoryDestination::new();
        run(&dest).await.unwrap();
        let once = dest.rows().await;
        run(&dest).await.unwrap();
        assert_eq!(dest.rows().await, once);
        assert_eq!(once.len(), 2);
        assert_eq!(
            dest.get("account", "acc1").await.unwrap().entity.raw,
            json!({"v": 3})
        );
    }

    #[tokio::test]
    async fn failed_flush_applies_nothing() {
        let dest = MemoryDestination::new();
        dest.fail_next_flushes(1).await;
        assert!(run(&dest).await.is_err());
        assert!(dest.rows().await.is_empty());
        assert!(dest.flush_sizes().await.is_empty());

        run(&dest).await.unwrap();
        assert_eq!(dest.flush_sizes().await, vec![2, 1]);
    }
}
