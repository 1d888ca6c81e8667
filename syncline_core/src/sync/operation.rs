use crate::Result;
use crate::models::ConnectionId;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Ordered stream of operations flowing through every pipeline stage.
pub type OpStream = Pin<Box<dyn Stream<Item = Result<SyncOperation>> + Send + 'static>>;

/// A record as it travels through the pipeline.
///
/// `raw` is the verbatim connector payload. `unified` is filled in by the
/// mapper stage; both are treated as immutable once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub raw: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified: Option<serde_json::Value>,
}

impl Entity {
    pub fn raw(raw: serde_json::Value) -> Self {
        Self { raw, unified: None }
    }

    pub fn with_unified(self, unified: serde_json::Value) -> Self {
        Self {
            raw: self.raw,
            unified: Some(unified),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataOp {
    pub id: String,
    pub entity_name: String,
    pub entity: Entity,
    pub connection_id: ConnectionId,
}

impl DataOp {
    pub fn new(
        id: impl Into<String>,
        entity_name: impl Into<String>,
        raw: serde_json::Value,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            id: id.into(),
            entity_name: entity_name.into(),
            entity: Entity::raw(raw),
            connection_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub connection_id: ConnectionId,
    /// Shallow patch merged into the connection's settings.
    pub patch: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub stream_name: String,
    /// Opaque cursor, interpreted only by the source adapter that wrote it.
    pub state: serde_json::Value,
}

/// The envelope every link consumes and produces.
///
/// A `Commit` closes a transaction: operations before it are durable only once
/// the commit has been processed, and a commit is never skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncOperation {
    Data(DataOp),
    Commit,
    ConnectionUpdate(ConnectionUpdate),
    StateUpdate(StateUpdate),
}

/// Discriminant of a `SyncOperation`, handy for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Data,
    Commit,
    ConnectionUpdate,
    StateUpdate,
}

impl SyncOperation {
    pub fn data(op: DataOp) -> Self {
        Self::Data(op)
    }

    pub fn state(stream_name: impl Into<String>, state: serde_json::Value) -> Self {
        Self::StateUpdate(StateUpdate {
            stream_name: stream_name.into(),
            state,
        })
    }

    pub fn connection_update(connection_id: ConnectionId, patch: serde_json::Value) -> Self {
        Self::ConnectionUpdate(ConnectionUpdate {
            connection_id,
            patch,
        })
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Data(_) => OpKind::Data,
            Self::Commit => OpKind::Commit,
            Self::ConnectionUpdate(_) => OpKind::ConnectionUpdate,
            Self::StateUpdate(_) => OpKind::StateUpdate,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit)
    }
}

/// Wrap an in-memory list of operations as a stream (tests, replays).
pub fn ops_stream(ops: Vec<SyncOperation>) -> OpStream {
    Box::pin(futures_util::stream::iter(ops.into_iter().map(Ok)))
}
