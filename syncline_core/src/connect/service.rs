use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;

use crate::connect::models::{ConnectContext, ConnectOutput, ConnectSession, ConnectState};
use crate::models::{Connection, ConnectionId, ConnectorConfig, ConnectorConfigId};
use crate::registry::ConnectorRegistry;
use crate::store::traits::SyncStore;
use crate::{Error, Result};

/// Result of a completed connect flow.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub session: ConnectSession,
    pub connection: Connection,
    /// False when an existing connection for the same external account was updated.
    pub created: bool,
    pub trigger_default_sync: bool,
}

/// Sessions still waiting on the external step are dropped after this long.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Drives connect sessions and owns the connection lifecycle.
///
/// A `Connection` is written only once `post_connect` succeeds; a failure at
/// any step leaves the store untouched. Only in-flight sessions are kept;
/// a session is forgotten once it reaches a terminal state.
pub struct ConnectService {
    store: Arc<dyn SyncStore>,
    registry: Arc<ConnectorRegistry>,
    sessions: DashMap<String, ConnectSession>,
    session_ttl: Duration,
}

impl ConnectService {
    pub fn new(store: Arc<dyn SyncStore>, registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            store,
            registry,
            sessions: DashMap::new(),
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Number of sessions in flight.
    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn expire_sessions(&self) {
        let cutoff = Utc::now() - self.session_ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.updated_at > cutoff);
        let expired = before.saturating_sub(self.sessions.len());
        if expired > 0 {
            tracing::debug!(expired, "expired abandoned connect sessions");
        }
    }

    pub fn session(&self, session_id: &str) -> Option<ConnectSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    async fn load_config(&self, id: &ConnectorConfigId) -> Result<ConnectorConfig> {
        self.store
            .get_connector_config(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connector config '{id}' not found")))
    }

    fn as_connect_error(connector_name: &str, e: Error) -> Error {
        match e {
            Error::ConnectFlow { .. } => e,
            other => Error::connect_flow(connector_name, other.to_string()),
        }
    }

    /// Run `pre_connect` and park the session until the external step returns.
    #[tracing::instrument(level = "info", skip(self, ctx))]
    pub async fn start(
        &self,
        connector_config_id: &ConnectorConfigId,
        ctx: ConnectContext,
    ) -> Result<ConnectSession> {
        self.expire_sessions();
        let config = self.load_config(connector_config_id).await?;
        let flow = self.registry.connect_flow(&config.connector_name)?;

        let mut session =
            ConnectSession::new(config.connector_name.clone(), config.id.clone(), ctx);
        session.transition(ConnectState::PreConnecting)?;

        match flow.pre_connect(&config, &session.context) {
            Ok(input) => {
                session.connect_input = Some(input);
                session.transition(ConnectState::AwaitingExternalAuth)?;
                self.sessions.insert(session.id.clone(), session.clone());
                Ok(session)
            }
            Err(e) => {
                let err = Self::as_connect_error(&config.connector_name, e);
                session.fail(err.to_string());
                tracing::warn!(session_id = %session.id, error = %err, "pre_connect failed");
                Err(err)
            }
        }
    }

    /// Feed the external step's output to `post_connect` and persist the connection.
    #[tracing::instrument(level = "info", skip(self, output))]
    pub async fn complete(&self, session_id: &str, output: ConnectOutput) -> Result<ConnectOutcome> {
        let mut session = {
            let mut entry = self.sessions.get_mut(session_id).ok_or_else(|| {
                Error::NotFound(format!("connect session '{session_id}' not found"))
            })?;
            entry.transition(ConnectState::PostConnecting)?;
            entry.clone()
        };

        match self.finish_post_connect(&session, output).await {
            Ok((connection, created, trigger_default_sync)) => {
                session.connection_id = Some(connection.id.clone());
                self.sessions.remove(&session.id);
                session.transition(ConnectState::Connected)?;
                tracing::info!(
                    session_id = %session.id,
                    connection_id = %connection.id,
                    created,
                    "connection established"
                );
                Ok(ConnectOutcome {
                    session,
                    connection,
                    created,
                    trigger_default_sync,
                })
            }
            Err(e) => {
                let err = Self::as_connect_error(&session.connector_name, e);
                session.fail(err.to_string());
                tracing::warn!(session_id = %session.id, error = %err, "post_connect failed");
                self.sessions.remove(&session.id);
                Err(err)
            }
        }
    }

    async fn finish_post_connect(
        &self,
        session: &ConnectSession,
        output: ConnectOutput,
    ) -> Result<(Connection, bool, bool)> {
        let config = self.load_config(&session.connector_config_id).await?;
        let flow = self.registry.connect_flow(&config.connector_name)?;
        let result = flow.post_connect(output, &config).await?;

        let existing = match (&session.context.connection_id, &result.connection_external_id) {
            (Some(id), _) => {
                let conn = self.store.get_connection(id).await?;
                if let Some(conn) = &conn
                    && conn.connector_config_id != config.id
                {
                    return Err(Error::Conflict(format!(
                        "connection '{id}' belongs to connector config '{}', not '{}'",
                        conn.connector_config_id, config.id
                    )));
                }
                conn
            }
            (None, Some(external_id)) => {
                self.store
                    .find_connection_by_external_id(&config.id, external_id)
                    .await?
            }
            (None, None) => None,
        };

        let (connection, created) = match existing {
            Some(mut conn) => {
                conn.settings = result.settings;
                conn.external_id = result.connection_external_id.or(conn.external_id);
                conn.disabled = false;
                conn.updated_at = Utc::now();
                (conn, false)
            }
            None => (
                Connection::new(
                    &config,
                    session.context.customer_id.clone(),
                    result.connection_external_id,
                    result.settings,
                ),
                true,
            ),
        };
        self.store.upsert_connection(&connection).await?;
        Ok((connection, created, result.trigger_default_sync))
    }

    /// Soft delete: the connection stays for audit but is no longer synced.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disable_connection(&self, id: &ConnectionId) -> Result<Connection> {
        let mut conn = self
            .store
            .get_connection(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection '{id}' not found")))?;
        conn.disabled = true;
        conn.updated_at = Utc::now();
        self.store.upsert_connection(&conn).await?;
        Ok(conn)
    }

    /// Hard delete of the connection and its sync state.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_connection(&self, id: &ConnectionId) -> Result<()> {
        if self.store.get_connection(id).await?.is_none() {
            return Err(Error::NotFound(format!("connection '{id}' not found")));
        }
        self.store.delete_connection(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::models::{ConnectInput, PostConnectResult};
    use crate::connect::traits::ConnectFlow;
    use crate::models::OrgId;
    use crate::store::memory::MemorySyncStore;
    use crate::store::models::ListQuery;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    /// Accepts `{"code": "..."}`; code "bad" fails the exchange.
    struct FakeOAuth;

    #[async_trait]
    impl ConnectFlow for FakeOAuth {
        fn connector_name(&self) -> &'static str {
            "fake"
        }

        fn pre_connect(&self, config: &ConnectorConfig, _: &ConnectContext) -> Result<ConnectInput> {
            Ok(ConnectInput(json!({"client_id": config.config["client_id"]})))
        }

        async fn post_connect(
            &self,
            output: ConnectOutput,
            _: &ConnectorConfig,
        ) -> Result<PostConnectResult> {
            let code = output.0["code"].as_str().unwrap_or_default();
            if code == "bad" {
                return Err(Error::BackendMessage("invalid_grant".to_string()));
            }
            Ok(PostConnectResult {
                connection_external_id: Some("acct-1".to_string()),
                settings: json!({"access_token": format!("tok-{code}")}),
                trigger_default_sync: true,
            })
        }
    }

    async fn setup() -> (ConnectService, MemorySyncStore, ConnectorConfig) {
        let store = MemorySyncStore::new();
        let config =
            ConnectorConfig::new(OrgId(Uuid::new_v4()), "fake", json!({"client_id": "cid"})).unwrap();
        store.upsert_connector_config(&config).await.unwrap();
        let mut registry = ConnectorRegistry::new();
        registry.register_connect_flow(Arc::new(FakeOAuth)).unwrap();
        let svc = ConnectService::new(Arc::new(store.clone()), Arc::new(registry));
        (svc, store, config)
    }

    #[tokio::test]
    async fn successful_flow_persists_one_connection() {
        let (svc, store, config) = setup().await;
        let session = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        assert_eq!(session.state, ConnectState::AwaitingExternalAuth);
        assert_eq!(session.connect_input, Some(ConnectInput(json!({"client_id": "cid"}))));

        let outcome = svc
            .complete(&session.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap();
        assert!(outcome.created);
        assert!(outcome.trigger_default_sync);
        assert_eq!(outcome.session.state, ConnectState::Connected);
        assert_eq!(
            store.get_connection(&outcome.connection.id).await.unwrap().unwrap().settings,
            json!({"access_token": "tok-c1"})
        );
    }

    #[tokio::test]
    async fn failed_post_connect_leaves_no_connection() {
        let (svc, store, config) = setup().await;
        let session = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        let err = svc
            .complete(&session.id, ConnectOutput(json!({"code": "bad"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFlow { .. }));
        assert!(svc.session(&session.id).is_none());
        assert_eq!(svc.pending_sessions(), 0);
        assert!(
            store
                .list_connections(None, ListQuery::default())
                .await
                .unwrap()
                .is_empty()
        );

        let again = svc
            .complete(&session.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap_err();
        assert!(matches!(again, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn completed_sessions_are_forgotten() {
        let (svc, _, config) = setup().await;
        let session = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        assert_eq!(svc.pending_sessions(), 1);
        svc.complete(&session.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap();
        assert_eq!(svc.pending_sessions(), 0);
    }

    #[tokio::test]
    async fn abandoned_sessions_expire() {
        let (svc, _, config) = setup().await;
        let svc = svc.with_session_ttl(Duration::zero());
        let abandoned = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        let fresh = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        assert!(svc.session(&abandoned.id).is_none());
        assert!(svc.session(&fresh.id).is_some());
    }

    #[tokio::test]
    async fn reconnect_cannot_take_over_another_configs_connection() {
        let (svc, store, config_a) = setup().await;
        let config_b =
            ConnectorConfig::new(OrgId(Uuid::new_v4()), "fake", json!({"client_id": "other"}))
                .unwrap();
        store.upsert_connector_config(&config_b).await.unwrap();
        let owned = Connection::new(
            &config_b,
            None,
            Some("acct-b".to_string()),
            json!({"access_token": "tok-b"}),
        );
        store.upsert_connection(&owned).await.unwrap();

        let ctx = ConnectContext {
            connection_id: Some(owned.id.clone()),
            ..ConnectContext::default()
        };
        let session = svc.start(&config_a.id, ctx).await.unwrap();
        let err = svc
            .complete(&session.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFlow { .. }));

        let stored = store.get_connection(&owned.id).await.unwrap().unwrap();
        assert_eq!(stored.settings, json!({"access_token": "tok-b"}));
        assert_eq!(stored.external_id.as_deref(), Some("acct-b"));
        assert_eq!(stored.connector_config_id, config_b.id);
    }

    #[tokio::test]
    async fn reconnecting_the_same_account_updates_instead_of_duplicating() {
        let (svc, store, config) = setup().await;
        let first = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        let a = svc
            .complete(&first.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap();
        let second = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        let b = svc
            .complete(&second.id, ConnectOutput(json!({"code": "c2"})))
            .await
            .unwrap();

        assert!(!b.created);
        assert_eq!(a.connection.id, b.connection.id);
        let all = store.list_connections(None, ListQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].settings, json!({"access_token": "tok-c2"}));
    }

    #[tokio::test]
    async fn disable_and_delete_connection() {
        let (svc, store, config) = setup().await;
        let s = svc.start(&config.id, ConnectContext::default()).await.unwrap();
        let out = svc
            .complete(&s.id, ConnectOutput(json!({"code": "c1"})))
            .await
            .unwrap();
        let id = out.connection.id;
        store.upsert_stream_state(&id, "contact", json!(5)).await.unwrap();

        assert!(svc.disable_connection(&id).await.unwrap().disabled);
        svc.delete_connection(&id).await.unwrap();
        assert!(store.get_sync_state(&id).await.unwrap().is_empty());
        assert!(matches!(
            svc.delete_connection(&id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_config_is_not_found() {
        let (svc, _, _) = setup().await;
        assert!(matches!(
            svc.start(&"ccfg_missing".into(), ConnectContext::default()).await,
            Err(Error::NotFound(_))
        ));
    }
}
