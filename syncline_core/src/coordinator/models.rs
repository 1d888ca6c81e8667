use crate::models::ConnectionId;
use crate::source::SyncMode;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What to sync: one source connection into one destination connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source_connection_id: ConnectionId,
    pub destination_connection_id: ConnectionId,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Restrict the run to these sub-streams; empty means every stream.
    #[serde(default)]
    pub streams: Vec<String>,
    /// Run records through the unified mappers; `false` loads raw records.
    #[serde(default = "default_unify")]
    pub unify: bool,
}

fn default_unify() -> bool {
    true
}

impl SyncRequest {
    pub fn new(source: ConnectionId, destination: ConnectionId) -> Self {
        Self {
            source_connection_id: source,
            destination_connection_id: destination,
            sync_mode: SyncMode::Incremental,
            streams: Vec::new(),
            unify: true,
        }
    }

    pub fn full(mut self) -> Self {
        self.sync_mode = SyncMode::Full;
        self
    }

    pub fn raw(mut self) -> Self {
        self.unify = false;
        self
    }
}

/// A single sync execution record (durable, queryable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub source_connection_id: ConnectionId,
    pub destination_connection_id: ConnectionId,
    pub sync_mode: SyncMode,
    pub status: RunStatus,
    /// Pipeline attempts made; retries resume from the last persisted cursor.
    pub attempts: u32,
    /// Data records covered by processed commits.
    pub records: u64,
    /// Commits processed after a successful flush.
    pub commits: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SyncRun {
    #[tracing::instrument(level = "debug")]
    pub fn new_running(request: &SyncRequest, started_at: DateTime<Utc>) -> Result<Self> {
        if request.source_connection_id == request.destination_connection_id {
            return Err(Error::InvalidInput(
                "source and destination connection must differ".to_string(),
            ));
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            source_connection_id: request.source_connection_id.clone(),
            destination_connection_id: request.destination_connection_id.clone(),
            sync_mode: request.sync_mode,
            status: RunStatus::Running,
            attempts: 0,
            records: 0,
            commits: 0,
            started_at,
            finished_at: None,
            error_message: None,
        })
    }

    pub fn finish(&mut self, status: RunStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
