//! Source adapters: turn a paginated external API into an `OpStream`.
//!
//! Most sources share one shape, the "iterate entities" loop implemented by
//! [`iterate_entities`]: for each declared sub-stream, resume from the stored
//! cursor, fetch page after page, and after every page emit the page's
//! records, the advanced cursor and a commit. A failure on page N therefore
//! never tears a batch: the next run resumes from page N's starting cursor.

use crate::error::ErrorContext;
use crate::models::Connection;
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::models::SyncState;
use crate::sync::operation::{DataOp, OpStream, SyncOperation};
use crate::sync::row_id::RowIdAssigner;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Resume every stream from its stored cursor.
    #[default]
    Incremental,
    /// Ignore stored cursors and start from the provider's earliest page.
    Full,
}

/// Everything a source needs for one run.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub connection: Connection,
    /// Connector config (`ConnectorConfig::config`), already validated.
    pub config: serde_json::Value,
    pub state: SyncState,
    pub sync_mode: SyncMode,
    /// Sub-streams requested for this run; empty means all of them.
    pub streams: Vec<String>,
    /// Retry policy for each page fetch.
    pub retry: RetryPolicy,
}

impl SourceContext {
    /// Cursor to resume `stream_name` from; always `None` on a full sync.
    pub fn cursor(&self, stream_name: &str) -> Option<&serde_json::Value> {
        match self.sync_mode {
            SyncMode::Full => None,
            SyncMode::Incremental => self.state.cursor(stream_name),
        }
    }

    /// Narrow `declared` to the requested sub-streams, keeping declaration order.
    pub fn select_streams(&self, declared: Vec<StreamSpec>) -> Vec<StreamSpec> {
        if self.streams.is_empty() {
            return declared;
        }
        declared
            .into_iter()
            .filter(|s| self.streams.contains(&s.stream_name))
            .collect()
    }

    pub fn error_context(&self, stream_name: &str) -> ErrorContext {
        ErrorContext::new(self.connection.connector_name.clone())
            .with_connection(self.connection.id.to_string())
            .with_stream(stream_name)
    }
}

/// A declared sub-stream of a source (e.g. `contact`, `transaction`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub stream_name: String,
    /// Entity name stamped on every data op of the stream.
    pub entity_name: String,
}

impl StreamSpec {
    pub fn new(stream_name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            entity_name: entity_name.into(),
        }
    }

    /// Stream whose entity name equals its stream name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            stream_name: name.clone(),
            entity_name: name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    /// Natural id; when absent a content-derived row id is assigned.
    pub id: Option<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<PageRecord>,
    /// Cursor to persist once this page is committed.
    pub next_cursor: Option<serde_json::Value>,
    pub has_more: bool,
}

/// Fetches one page of one sub-stream. Implementations report rate limits and
/// 5xx responses as `Error::AdapterTransient` so the pager can retry them.
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        cursor: Option<&serde_json::Value>,
    ) -> Result<Page>;
}

/// A connector's extraction side.
pub trait SourceAdapter: Send + Sync {
    fn connector_name(&self) -> &'static str;

    /// Sub-streams this source can emit.
    fn streams(&self) -> Vec<StreamSpec>;

    /// Build the operation stream for one run. Settings are validated here,
    /// before any network call.
    fn source_sync(&self, ctx: SourceContext) -> Result<OpStream>;
}

/// The shared pagination loop.
///
/// Per stream: an empty page ends the stream; so does a page without
/// `has_more`, and a page that claims more data without advancing the cursor.
pub fn iterate_entities(
    ctx: SourceContext,
    streams: Vec<StreamSpec>,
    fetcher: Arc<dyn PageFetcher>,
) -> OpStream {
    Box::pin(async_stream::stream! {
        let connection_id = ctx.connection.id.clone();

        for spec in streams {
            // Per stream, so narrowing `streams` leaves the other streams' ids unchanged.
            let mut row_ids = RowIdAssigner::new();
            let err_ctx = ctx.error_context(&spec.stream_name);
            let mut cursor = ctx.cursor(&spec.stream_name).cloned();
            let mut pages = 0u64;
            tracing::debug!(
                connection_id = %connection_id,
                stream_name = %spec.stream_name,
                resume = cursor.is_some(),
                "starting stream"
            );

            loop {
                let page = retry_transient(&ctx.retry, &err_ctx, || {
                    fetcher.fetch_page(&spec, cursor.as_ref())
                })
                .await;
                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                pages += 1;

                if page.records.is_empty() {
                    break;
                }

                for record in page.records {
                    let id = match record.id {
                        Some(id) => id,
                        None => row_ids.assign(&record.data),
                    };
                    yield Ok(SyncOperation::Data(DataOp::new(
                        id,
                        spec.entity_name.clone(),
                        record.data,
                        connection_id.clone(),
                    )));
                }

                let advanced = page.next_cursor.is_some() && page.next_cursor != cursor;
                if let Some(next) = &page.next_cursor {
                    yield Ok(SyncOperation::state(spec.stream_name.clone(), next.clone()));
                }
                yield Ok(SyncOperation::Commit);

                if !page.has_more {
                    break;
                }
                if !advanced {
                    tracing::warn!(
                        connection_id = %connection_id,
                        stream_name = %spec.stream_name,
                        "page reported more data without advancing the cursor; ending stream"
                    );
                    break;
                }
                cursor = page.next_cursor;
            }

            tracing::debug!(
                connection_id = %connection_id,
                stream_name = %spec.stream_name,
                pages,
                "finished stream"
            );
        }
    })
}

/// Order two cursor values: numbers numerically, RFC 3339 strings by instant,
/// other strings lexically. Values of different shapes are incomparable.
pub fn compare_cursors(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc));
            match (parse(x), parse(y)) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

/// Monotonic cursor advance: keeps the greater of `prev` and `candidate`.
pub fn advance_cursor(
    prev: Option<&serde_json::Value>,
    candidate: serde_json::Value,
) -> serde_json::Value {
    match prev {
        Some(prev) if compare_cursors(prev, &candidate) == Some(Ordering::Greater) => prev.clone(),
        _ => candidate,
    }
}
