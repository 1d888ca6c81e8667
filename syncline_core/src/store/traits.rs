use crate::Result;
use crate::coordinator::models::SyncRun;
use crate::models::{Connection, ConnectionId, ConnectorConfig, ConnectorConfigId};
use crate::store::models::{ListQuery, SyncState};
use async_trait::async_trait;
use uuid::Uuid;

/// Durable storage for everything the engine owns: connector configs,
/// connections, per-stream cursors and run records.
///
/// The persistence technology is the host application's choice.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn upsert_connector_config(&self, config: &ConnectorConfig) -> Result<()>;
    async fn get_connector_config(&self, id: &ConnectorConfigId)
    -> Result<Option<ConnectorConfig>>;

    async fn upsert_connection(&self, connection: &Connection) -> Result<()>;
    async fn get_connection(&self, id: &ConnectionId) -> Result<Option<Connection>>;
    /// Lookup used to dedupe reconnects of the same external account.
    async fn find_connection_by_external_id(
        &self,
        connector_config_id: &ConnectorConfigId,
        external_id: &str,
    ) -> Result<Option<Connection>>;
    async fn list_connections(
        &self,
        connector_config_id: Option<&ConnectorConfigId>,
        query: ListQuery,
    ) -> Result<Vec<Connection>>;
    /// Hard delete. Removes the connection's sync state as well.
    async fn delete_connection(&self, id: &ConnectionId) -> Result<()>;

    /// Cursors of a connection; an empty state when nothing was persisted yet.
    async fn get_sync_state(&self, connection_id: &ConnectionId) -> Result<SyncState>;
    async fn upsert_stream_state(
        &self,
        connection_id: &ConnectionId,
        stream_name: &str,
        cursor: serde_json::Value,
    ) -> Result<()>;

    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<()>;
    async fn get_sync_run(&self, run_id: Uuid) -> Result<Option<SyncRun>>;
    /// Runs that used `connection_id` as source or destination, newest first.
    async fn list_sync_runs(
        &self,
        connection_id: &ConnectionId,
        query: ListQuery,
    ) -> Result<Vec<SyncRun>>;
}
