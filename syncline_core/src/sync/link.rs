//! Links: composable `OpStream -> OpStream` transforms.
//!
//! A pipeline is `link_n(...link_1(source))`. Links only wire streams together;
//! side effects (network calls, buffering) live inside handler implementations.
//! An error from a handler is yielded once and ends the stream.

use crate::Result;
use crate::sync::operation::{ConnectionUpdate, DataOp, OpStream, StateUpdate, SyncOperation};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// A stream transform over `SyncOperation`s.
///
/// Implemented for every `FnOnce(OpStream) -> OpStream + Send`, so plain
/// closures are links.
pub trait Link: Send {
    fn apply(self: Box<Self>, input: OpStream) -> OpStream;
}

impl<F> Link for F
where
    F: FnOnce(OpStream) -> OpStream + Send,
{
    fn apply(self: Box<Self>, input: OpStream) -> OpStream {
        (*self)(input)
    }
}

pub type BoxLink = Box<dyn Link>;

/// Box a closure as a link.
pub fn link<F>(f: F) -> BoxLink
where
    F: FnOnce(OpStream) -> OpStream + Send + 'static,
{
    Box::new(f)
}

/// Compose links left to right: `compose([a, b])(s) == b(a(s))`.
pub fn compose(links: Vec<BoxLink>) -> BoxLink {
    link(move |input: OpStream| pipe(input, links))
}

/// Run `source` through `links` in order.
pub fn pipe(source: OpStream, links: Vec<BoxLink>) -> OpStream {
    links.into_iter().fold(source, |stream, l| l.apply(stream))
}

/// Identity link.
pub fn noop_link() -> BoxLink {
    link(|input: OpStream| input)
}

/// Per-kind handlers used by `handlers_link`.
///
/// Each handler returns the operations to emit downstream, possibly none.
/// Kinds that are not overridden pass through unchanged.
#[async_trait]
pub trait OpHandlers: Send + 'static {
    async fn on_data(&mut self, op: DataOp) -> Result<Vec<SyncOperation>> {
        Ok(vec![SyncOperation::Data(op)])
    }

    async fn on_commit(&mut self) -> Result<Vec<SyncOperation>> {
        Ok(vec![SyncOperation::Commit])
    }

    async fn on_connection_update(
        &mut self,
        update: ConnectionUpdate,
    ) -> Result<Vec<SyncOperation>> {
        Ok(vec![SyncOperation::ConnectionUpdate(update)])
    }

    async fn on_state_update(&mut self, update: StateUpdate) -> Result<Vec<SyncOperation>> {
        Ok(vec![SyncOperation::StateUpdate(update)])
    }

    /// Called once after the input completes without error.
    async fn on_end(&mut self) -> Result<Vec<SyncOperation>> {
        Ok(Vec::new())
    }
}

async fn dispatch<H: OpHandlers>(handlers: &mut H, op: SyncOperation) -> Result<Vec<SyncOperation>> {
    match op {
        SyncOperation::Data(data) => handlers.on_data(data).await,
        SyncOperation::Commit => handlers.on_commit().await,
        SyncOperation::ConnectionUpdate(update) => handlers.on_connection_update(update).await,
        SyncOperation::StateUpdate(update) => handlers.on_state_update(update).await,
    }
}

/// Dispatch every operation to the matching handler of `handlers`.
pub fn handlers_link<H: OpHandlers>(handlers: H) -> BoxLink {
    link(move |mut input: OpStream| -> OpStream {
        let mut handlers = handlers;
        Box::pin(async_stream::stream! {
            while let Some(item) = input.next().await {
                let op = match item {
                    Ok(op) => op,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                match dispatch(&mut handlers, op).await {
                    Ok(out) => {
                        for op in out {
                            yield Ok(op);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            match handlers.on_end().await {
                Ok(out) => {
                    for op in out {
                        yield Ok(op);
                    }
                }
                Err(e) => yield Err(e),
            }
        })
    })
}

/// Apply `f` to data operations only. Returning `Ok(None)` drops the record.
pub fn map_data_link<F>(f: F) -> BoxLink
where
    F: FnMut(DataOp) -> Result<Option<DataOp>> + Send + 'static,
{
    link(move |mut input: OpStream| -> OpStream {
        let mut f = f;
        Box::pin(async_stream::stream! {
            while let Some(item) = input.next().await {
                match item {
                    Ok(SyncOperation::Data(data)) => match f(data) {
                        Ok(Some(data)) => yield Ok(SyncOperation::Data(data)),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    },
                    Ok(other) => yield Ok(other),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    })
}

/// Observe every operation without changing the stream.
pub fn tap_link<F>(f: F) -> BoxLink
where
    F: FnMut(&SyncOperation) + Send + 'static,
{
    link(move |input: OpStream| -> OpStream {
        let mut f = f;
        Box::pin(input.inspect(move |item| {
            if let Ok(op) = item {
                f(op);
            }
        }))
    })
}

/// Debug-level trace of every operation passing this point.
pub fn log_link(label: &'static str) -> BoxLink {
    tap_link(move |op| match op {
        SyncOperation::Data(data) => tracing::debug!(
            link = label,
            kind = "data",
            entity_name = %data.entity_name,
            id = %data.id,
        ),
        SyncOperation::StateUpdate(update) => {
            tracing::debug!(link = label, kind = "state_update", stream_name = %update.stream_name)
        }
        other => tracing::debug!(link = label, kind = ?other.kind()),
    })
}

/// Decouple producer and consumer through a bounded channel.
///
/// The upstream is driven on a spawned task (requires a Tokio runtime). At most
/// `capacity` operations are buffered; a full buffer pauses the upstream, and
/// dropping the downstream stops it at its next send.
pub fn buffered_link(capacity: usize) -> BoxLink {
    link(move |mut input: OpStream| -> OpStream {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(item) = input.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    tracing::debug!("buffered link consumer dropped; stopping upstream");
                    break;
                }
                if failed {
                    break;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    })
}

/// Drain a stream, stopping at the first error.
pub async fn collect_ops(mut stream: OpStream) -> Result<Vec<SyncOperation>> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.push(item?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorContext};
    use crate::models::ConnectionId;
    use crate::sync::operation::ops_stream;
    use serde_json::json;

    fn data(id: &str, entity_name: &str) -> SyncOperation {
        SyncOperation::Data(DataOp::new(
            id,
            entity_name,
            json!({"id": id}),
            ConnectionId::from("conn_1"),
        ))
    }

    fn ids(ops: &[SyncOperation]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                SyncOperation::Data(d) => d.id.clone(),
                other => format!("{:?}", other.kind()),
            })
            .collect()
    }

    struct CountingHandlers {
        seen_data: usize,
    }

    #[async_trait]
    impl OpHandlers for CountingHandlers {
        async fn on_data(&mut self, op: DataOp) -> Result<Vec<SyncOperation>> {
            self.seen_data += 1;
            if op.id == "boom" {
                return Err(Error::fatal(ErrorContext::new("test"), "boom"));
            }
            let mut op = op;
            op.id = format!("{}#{}", op.id, self.seen_data);
            Ok(vec![SyncOperation::Data(op)])
        }
    }

    #[tokio::test]
    async fn handlers_link_passes_unmatched_kinds_through() {
        let source = ops_stream(vec![
            data("a", "contact"),
            SyncOperation::state("contact", json!(1)),
            SyncOperation::Commit,
        ]);
        let out = collect_ops(handlers_link(CountingHandlers { seen_data: 0 }).apply(source))
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a#1", "StateUpdate", "Commit"]);
    }

    #[tokio::test]
    async fn handler_error_terminates_the_stream() {
        let source = ops_stream(vec![
            data("a", "contact"),
            data("boom", "contact"),
            data("c", "contact"),
            SyncOperation::Commit,
        ]);
        let mut stream = handlers_link(CountingHandlers { seen_data: 0 }).apply(source);
        assert!(matches!(stream.next().await, Some(Ok(SyncOperation::Data(_)))));
        assert!(matches!(stream.next().await, Some(Err(Error::AdapterFatal { .. }))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn map_data_link_only_touches_data() {
        let source = ops_stream(vec![
            data("keep", "contact"),
            data("drop", "contact"),
            SyncOperation::Commit,
        ]);
        let l = map_data_link(|d| Ok((d.id != "drop").then_some(d)));
        let out = collect_ops(l.apply(source)).await.unwrap();
        assert_eq!(ids(&out), vec!["keep", "Commit"]);
    }

    #[tokio::test]
    async fn compose_applies_links_in_order() {
        let append = |suffix: &'static str| {
            map_data_link(move |mut d| {
                d.id.push_str(suffix);
                Ok(Some(d))
            })
        };
        let pipeline = compose(vec![append("-1"), noop_link(), append("-2")]);
        let out = collect_ops(pipeline.apply(ops_stream(vec![data("x", "contact")])))
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["x-1-2"]);
    }

    #[tokio::test]
    async fn tap_link_sees_every_op() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let counter = seen.clone();
        let l = tap_link(move |_| *counter.lock().unwrap() += 1);
        let out = collect_ops(l.apply(ops_stream(vec![data("a", "x"), SyncOperation::Commit])))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn buffered_link_preserves_order() {
        let ops: Vec<_> = (0..50).map(|i| data(&i.to_string(), "row")).collect();
        let out = collect_ops(buffered_link(1).apply(ops_stream(ops)))
            .await
            .unwrap();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(ids(&out), expected);
    }

    #[tokio::test]
    async fn buffered_link_pauses_upstream_when_full() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream: OpStream = Box::pin(futures_util::stream::iter(0u64..).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(data(&i.to_string(), "row"))
        }));

        let capacity = 4;
        let mut stream = buffered_link(capacity).apply(upstream);
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        // One extra item is held by the producer while it waits on the full channel.
        assert!(pulled.load(Ordering::SeqCst) <= capacity + 1);

        assert!(matches!(stream.next().await, Some(Ok(SyncOperation::Data(_)))));
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(pulled.load(Ordering::SeqCst) <= capacity + 2);

        drop(stream);
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        let stopped_at = pulled.load(Ordering::SeqCst);
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pulled.load(Ordering::SeqCst), stopped_at);
    }
}
