use crate::models::ConnectionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resumable per-stream cursors of one connection.
///
/// Cursor values are opaque to the engine; only the source adapter that
/// wrote them interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub streams: BTreeMap<String, serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn empty(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            streams: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn cursor(&self, stream_name: &str) -> Option<&serde_json::Value> {
        self.streams.get(stream_name)
    }

    pub fn set_cursor(&mut self, stream_name: impl Into<String>, cursor: serde_json::Value) {
        self.streams.insert(stream_name.into(), cursor);
        self.updated_at = Some(Utc::now());
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Paging for store listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}
