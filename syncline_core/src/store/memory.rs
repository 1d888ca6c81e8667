use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;
use crate::coordinator::models::SyncRun;
use crate::models::{Connection, ConnectionId, ConnectorConfig, ConnectorConfigId};
use crate::store::models::{ListQuery, SyncState};
use crate::store::traits::SyncStore;

#[derive(Default)]
struct Tables {
    configs: HashMap<ConnectorConfigId, ConnectorConfig>,
    connections: HashMap<ConnectionId, Connection>,
    states: HashMap<ConnectionId, SyncState>,
    runs: HashMap<Uuid, SyncRun>,
    /// Successful `upsert_stream_state` calls, in order (inspected by tests).
    state_writes: Vec<(ConnectionId, String, serde_json::Value)>,
}

/// In-memory `SyncStore` for local development, the CLI and unit tests.
///
/// Durable only for the process lifetime.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed cursors, e.g. from a state file written by a previous run.
    pub async fn seed_state(&self, state: SyncState) {
        let mut tables = self.tables.write().await;
        tables.states.insert(state.connection_id.clone(), state);
    }

    pub async fn state_writes(&self) -> Vec<(ConnectionId, String, serde_json::Value)> {
        self.tables.read().await.state_writes.clone()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn upsert_connector_config(&self, config: &ConnectorConfig) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_connector_config(
        &self,
        id: &ConnectorConfigId,
    ) -> Result<Option<ConnectorConfig>> {
        Ok(self.tables.read().await.configs.get(id).cloned())
    }

    async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: &ConnectionId) -> Result<Option<Connection>> {
        Ok(self.tables.read().await.connections.get(id).cloned())
    }

    async fn find_connection_by_external_id(
        &self,
        connector_config_id: &ConnectorConfigId,
        external_id: &str,
    ) -> Result<Option<Connection>> {
        let tables = self.tables.read().await;
        Ok(tables
            .connections
            .values()
            .find(|c| {
                &c.connector_config_id == connector_config_id
                    && c.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn list_connections(
        &self,
        connector_config_id: Option<&ConnectorConfigId>,
        query: ListQuery,
    ) -> Result<Vec<Connection>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Connection> = tables
            .connections
            .values()
            .filter(|c| connector_config_id.is_none_or(|id| &c.connector_config_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn delete_connection(&self, id: &ConnectionId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.connections.remove(id);
        tables.states.remove(id);
        Ok(())
    }

    async fn get_sync_state(&self, connection_id: &ConnectionId) -> Result<SyncState> {
        Ok(self
            .tables
            .read()
            .await
            .states
            .get(connection_id)
            .cloned()
            .unwrap_or_else(|| SyncState::empty(connection_id.clone())))
    }

    async fn upsert_stream_state(
        &self,
        connection_id: &ConnectionId,
        stream_name: &str,
        cursor: serde_json::Value,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let state = tables
            .states
            .entry(connection_id.clone())
            .or_insert_with(|| SyncState::empty(connection_id.clone()));
        state.set_cursor(stream_name, cursor.clone());
        state.updated_at = Some(Utc::now());
        tables
            .state_writes
            .push((connection_id.clone(), stream_name.to_string(), cursor));
        Ok(())
    }

    async fn upsert_sync_run(&self, run: &SyncRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_sync_run(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
        Ok(self.tables.read().await.runs.get(&run_id).cloned())
    }

    async fn list_sync_runs(
        &self,
        connection_id: &ConnectionId,
        query: ListQuery,
    ) -> Result<Vec<SyncRun>> {
        let tables = self.tables.read().await;
        let mut out: Vec<SyncRun> = tables
            .runs
            .values()
            .filter(|r| {
                &r.source_connection_id == connection_id
                    || &r.destination_connection_id == connection_id
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrgId;
    use serde_json::json;

    fn connection(config: &ConnectorConfig, external_id: &str) -> Connection {
        Connection::new(config, None, Some(external_id.to_string()), json!({}))
    }

    #[tokio::test]
    async fn missing_state_reads_as_empty() {
        let store = MemorySyncStore::new();
        let state = store.get_sync_state(&"conn_x".into()).await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.connection_id, ConnectionId::from("conn_x"));
    }

    #[tokio::test]
    async fn deleting_a_connection_removes_its_state() {
        let store = MemorySyncStore::new();
        let cfg = ConnectorConfig::new(OrgId(Uuid::new_v4()), "hubspot", json!({})).unwrap();
        let conn = connection(&cfg, "portal-1");
        store.upsert_connection(&conn).await.unwrap();
        store
            .upsert_stream_state(&conn.id, "contact", json!("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        store.delete_connection(&conn.id).await.unwrap();
        assert!(store.get_connection(&conn.id).await.unwrap().is_none());
        assert!(store.get_sync_state(&conn.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finds_connections_by_external_id_within_a_config() {
        let store = MemorySyncStore::new();
        let org = OrgId(Uuid::new_v4());
        let a = ConnectorConfig::new(org, "hubspot", json!({})).unwrap();
        let b = ConnectorConfig::new(org, "hubspot", json!({})).unwrap();
        let conn = connection(&a, "portal-1");
        store.upsert_connection(&conn).await.unwrap();

        let found = store
            .find_connection_by_external_id(&a.id, "portal-1")
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some(conn.id));
        assert!(
            store
                .find_connection_by_external_id(&b.id, "portal-1")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store
                .list_connections(Some(&a.id), ListQuery::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
