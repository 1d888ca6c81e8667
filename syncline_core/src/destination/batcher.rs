use crate::destination::traits::{Batch, BatchPolicy, BatchWriter};
use crate::error::ErrorContext;
use crate::sync::link::{BoxLink, OpHandlers, handlers_link};
use crate::sync::operation::{ConnectionUpdate, DataOp, StateUpdate, SyncOperation};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Commit-gated batching in front of a `BatchWriter`.
///
/// - data ops are buffered and passed through unchanged;
/// - state and connection updates are buffered and withheld until the commit
///   that covers them has been flushed;
/// - on commit the whole batch goes out in one `flush`; on success the
///   withheld updates are emitted followed by the commit, on failure the batch
///   is kept and the stream fails with `DestinationFlush`.
///
/// Downstream consumers therefore only ever see a state update after the data
/// it covers is durable.
pub struct CommitBatcher {
    writer: Arc<dyn BatchWriter>,
    policy: BatchPolicy,
    context: ErrorContext,
    batch: Batch,
    flushes: u64,
}

impl CommitBatcher {
    pub fn new(writer: Arc<dyn BatchWriter>, policy: BatchPolicy, context: ErrorContext) -> Self {
        Self {
            writer,
            policy,
            context,
            batch: Batch::default(),
            flushes: 0,
        }
    }

    /// Unflushed operations (kept across a failed flush).
    pub fn pending(&self) -> &Batch {
        &self.batch
    }

    pub fn into_link(self) -> BoxLink {
        handlers_link(self)
    }

    fn flush_error(&self, e: Error) -> Error {
        match e {
            Error::DestinationFlush { .. } | Error::AdapterFatal { .. } => e,
            other => Error::flush(self.context.clone(), other.to_string()),
        }
    }

    async fn flush_all(&mut self) -> Result<Vec<SyncOperation>> {
        if self.batch.is_empty() {
            return Ok(vec![SyncOperation::Commit]);
        }
        let records = self.batch.data.len();
        if let Err(e) = self.writer.flush(&self.batch).await {
            tracing::warn!(
                context = %self.context,
                records,
                error = %e,
                "batch flush failed; keeping batch"
            );
            return Err(self.flush_error(e));
        }
        self.flushes += 1;
        tracing::debug!(context = %self.context, records, flushes = self.flushes, "batch flushed");

        let Batch {
            connection_updates,
            state_updates,
            ..
        } = std::mem::take(&mut self.batch);
        let mut out: Vec<SyncOperation> = connection_updates
            .into_iter()
            .map(SyncOperation::ConnectionUpdate)
            .collect();
        out.extend(state_updates.into_iter().map(SyncOperation::StateUpdate));
        out.push(SyncOperation::Commit);
        Ok(out)
    }

    /// Early flush of buffered data only, used when the batch cap is reached.
    async fn flush_data(&mut self) -> Result<()> {
        let partial = Batch {
            data: std::mem::take(&mut self.batch.data),
            ..Batch::default()
        };
        if let Err(e) = self.writer.flush(&partial).await {
            self.batch.data = partial.data;
            return Err(self.flush_error(e));
        }
        self.flushes += 1;
        tracing::debug!(
            context = %self.context,
            records = partial.data.len(),
            "batch cap reached; flushed data early"
        );
        Ok(())
    }
}

#[async_trait]
impl OpHandlers for CommitBatcher {
    async fn on_data(&mut self, op: DataOp) -> Result<Vec<SyncOperation>> {
        self.batch.data.push(op.clone());
        if let Some(cap) = self.policy.max_records
            && cap > 0
            && self.batch.data.len() >= cap
        {
            self.flush_data().await?;
        }
        Ok(vec![SyncOperation::Data(op)])
    }

    async fn on_commit(&mut self) -> Result<Vec<SyncOperation>> {
        self.flush_all().await
    }

    async fn on_connection_update(
        &mut self,
        update: ConnectionUpdate,
    ) -> Result<Vec<SyncOperation>> {
        self.batch.connection_updates.push(update);
        Ok(Vec::new())
    }

    async fn on_state_update(&mut self, update: StateUpdate) -> Result<Vec<SyncOperation>> {
        self.batch.state_updates.push(update);
        Ok(Vec::new())
    }

    /// A stream that ends cleanly closes its last batch with an implicit commit.
    async fn on_end(&mut self) -> Result<Vec<SyncOperation>> {
        if self.batch.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(context = %self.context, "stream ended with an open batch; committing");
        self.flush_all().await
    }
}

/// Destination link over `writer`.
pub fn batching_link(
    writer: Arc<dyn BatchWriter>,
    policy: BatchPolicy,
    context: ErrorContext,
) -> BoxLink {
    CommitBatcher::new(writer, policy, context).into_link()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionId;
    use crate::sync::link::{Link, collect_ops};
    use crate::sync::operation::{OpKind, ops_stream};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        flushed: Mutex<Vec<Batch>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn flush(&self, batch: &Batch) -> Result<()> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::BackendMessage("connection reset".to_string()));
            }
            self.flushed.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn data(id: &str, entity: &str) -> SyncOperation {
        SyncOperation::Data(DataOp::new(id, entity, json!({"id": id}), ConnectionId::from("conn_1")))
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.data.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn flushes_once_per_commit_with_exactly_that_batch() {
        let writer = Arc::new(RecordingWriter::default());
        let link = batching_link(writer.clone(), BatchPolicy::default(), ErrorContext::new("mem"));
        let out = collect_ops(link.apply(ops_stream(vec![
            data("acc1", "account"),
            data("acc2", "account"),
            SyncOperation::Commit,
            data("txn1", "transaction"),
            SyncOperation::Commit,
        ])))
        .await
        .unwrap();

        let flushed = writer.flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(ids(&flushed[0]), vec!["acc1", "acc2"]);
        assert_eq!(ids(&flushed[1]), vec!["txn1"]);
        assert_eq!(out.len(), 5);
    }

    #[tokio::test]
    async fn state_updates_are_released_after_their_flush() {
        let writer = Arc::new(RecordingWriter::default());
        let link = batching_link(writer.clone(), BatchPolicy::default(), ErrorContext::new("mem"));
        let out = collect_ops(link.apply(ops_stream(vec![
            data("a", "account"),
            SyncOperation::state("account", json!("c1")),
            SyncOperation::connection_update(ConnectionId::from("conn_1"), json!({"token": "t2"})),
            SyncOperation::Commit,
        ])))
        .await
        .unwrap();

        let kinds: Vec<_> = out.iter().map(|op| op.kind()).collect();
        assert_eq!(
            kinds,
            vec![OpKind::Data, OpKind::ConnectionUpdate, OpKind::StateUpdate, OpKind::Commit]
        );
        let flushed = writer.flushed.lock().unwrap();
        assert_eq!(flushed[0].state_updates.len(), 1);
        assert_eq!(flushed[0].connection_updates.len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_batch_and_withholds_state() {
        let writer = Arc::new(RecordingWriter::default());
        *writer.failures_left.lock().unwrap() = 1;
        let mut batcher =
            CommitBatcher::new(writer.clone(), BatchPolicy::default(), ErrorContext::new("mem"));

        batcher.on_data(DataOp::new("a", "account", json!({}), "conn_1".into())).await.unwrap();
        let withheld = batcher
            .on_state_update(StateUpdate {
                stream_name: "account".into(),
                state: json!(1),
            })
            .await
            .unwrap();
        assert!(withheld.is_empty());

        let err = batcher.on_commit().await.unwrap_err();
        assert!(matches!(err, Error::DestinationFlush { .. }));
        assert_eq!(batcher.pending().data.len(), 1);
        assert_eq!(batcher.pending().state_updates.len(), 1);
        assert!(writer.flushed.lock().unwrap().is_empty());

        let out = batcher.on_commit().await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(batcher.pending().is_empty());
        assert_eq!(ids(&writer.flushed.lock().unwrap()[0]), vec!["a"]);
    }

    #[tokio::test]
    async fn flush_error_ends_the_stream_before_the_commit() {
        let writer = Arc::new(RecordingWriter::default());
        *writer.failures_left.lock().unwrap() = 1;
        let link = batching_link(writer, BatchPolicy::default(), ErrorContext::new("mem"));
        let mut stream = link.apply(ops_stream(vec![
            data("a", "account"),
            SyncOperation::state("account", json!(1)),
            SyncOperation::Commit,
            data("b", "account"),
        ]));
        let mut ok = Vec::new();
        let mut errors = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(op) => ok.push(op),
                Err(_) => errors += 1,
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(ok.len(), 1);
        assert!(matches!(ok[0], SyncOperation::Data(_)));
    }

    #[tokio::test]
    async fn empty_commit_passes_through_without_flushing() {
        let writer = Arc::new(RecordingWriter::default());
        let link = batching_link(writer.clone(), BatchPolicy::default(), ErrorContext::new("mem"));
        let out = collect_ops(link.apply(ops_stream(vec![SyncOperation::Commit])))
            .await
            .unwrap();
        assert_eq!(out, vec![SyncOperation::Commit]);
        assert!(writer.flushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_batch_is_committed_when_the_stream_ends() {
        let writer = Arc::new(RecordingWriter::default());
        let link = batching_link(writer.clone(), BatchPolicy::default(), ErrorContext::new("mem"));
        let out = collect_ops(link.apply(ops_stream(vec![data("a", "account")])))
            .await
            .unwrap();
        assert_eq!(out.last(), Some(&SyncOperation::Commit));
        assert_eq!(writer.flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_cap_flushes_data_early_but_holds_state_for_the_commit() {
        let writer = Arc::new(RecordingWriter::default());
        let link = batching_link(
            writer.clone(),
            BatchPolicy {
                max_records: Some(2),
            },
            ErrorContext::new("mem"),
        );
        collect_ops(link.apply(ops_stream(vec![
            data("a", "account"),
            data("b", "account"),
            data("c", "account"),
            SyncOperation::state("account", json!(3)),
            SyncOperation::Commit,
        ])))
        .await
        .unwrap();

        let flushed = writer.flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(ids(&flushed[0]), vec!["a", "b"]);
        assert!(flushed[0].state_updates.is_empty());
        assert_eq!(ids(&flushed[1]), vec!["c"]);
        assert_eq!(flushed[1].state_updates.len(), 1);
    }
}
