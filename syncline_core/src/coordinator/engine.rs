use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordinator::models::{RunStatus, SyncRequest, SyncRun};
use crate::destination::traits::DestinationContext;
use crate::events::models::{Event, EventDirection, topics};
use crate::events::traits::EventBus;
use crate::mapper::registry::{MapperRegistry, unify_link};
use crate::models::{Connection, ConnectorConfig};
use crate::registry::ConnectorRegistry;
use crate::source::SourceContext;
use crate::store::traits::SyncStore;
use crate::sync::link::{BoxLink, buffered_link, pipe};
use crate::sync::operation::{ConnectionUpdate, StateUpdate, SyncOperation};
use crate::{Error, Result};

/// Builds a custom link for one pipeline attempt, placed between the unify
/// stage and the destination.
pub type LinkFactory = Arc<dyn Fn(&Connection) -> BoxLink + Send + Sync>;

enum AttemptOutcome {
    Completed,
    Cancelled,
}

/// Both ends of a run, resolved once per run.
struct Endpoints {
    source: Connection,
    source_config: ConnectorConfig,
    destination: Connection,
    destination_config: ConnectorConfig,
}

/// Runs one (source connection, destination connection) pair end to end.
///
/// The pipeline is `destination(custom(unify(source)))`. Cursors and
/// connection patches that come out of the destination are persisted when the
/// commit following them arrives, which the destination only emits after its
/// flush succeeded. A failed attempt is therefore safe to re-run from the
/// last persisted cursor.
pub struct SyncCoordinator {
    store: Arc<dyn SyncStore>,
    registry: Arc<ConnectorRegistry>,
    mappers: Arc<MapperRegistry>,
    event_bus: Arc<dyn EventBus>,
    config: EngineConfig,
    links: Vec<LinkFactory>,
    active: DashMap<Uuid, CancellationToken>,
}

impl SyncCoordinator {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        store: Arc<dyn SyncStore>,
        registry: Arc<ConnectorRegistry>,
        event_bus: Arc<dyn EventBus>,
        config: EngineConfig,
    ) -> Self {
        let mappers = Arc::new(registry.mappers().clone());
        Self {
            store,
            registry,
            mappers,
            event_bus,
            config,
            links: Vec::new(),
            active: DashMap::new(),
        }
    }

    /// Append a custom link to every pipeline this coordinator builds.
    pub fn with_link(mut self, factory: LinkFactory) -> Self {
        self.links.push(factory);
        self
    }

    /// Ids of runs currently in flight.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Request cancellation of an in-flight run. Takes effect at its next commit.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run several pairs concurrently; each run is independent.
    #[tracing::instrument(level = "info", skip_all, fields(runs = requests.len()))]
    pub async fn run_many(&self, requests: Vec<SyncRequest>) -> Vec<Result<SyncRun>> {
        let runs = requests
            .into_iter()
            .map(|req| self.run(req, CancellationToken::new()));
        futures_util::future::join_all(runs).await
    }

    async fn resolve(&self, request: &SyncRequest) -> Result<Endpoints> {
        let source = self.load_connection(&request.source_connection_id).await?;
        let destination = self.load_connection(&request.destination_connection_id).await?;
        let source_config = self.load_config(&source).await?;
        let destination_config = self.load_config(&destination).await?;
        Ok(Endpoints {
            source,
            source_config,
            destination,
            destination_config,
        })
    }

    async fn load_connection(&self, id: &crate::models::ConnectionId) -> Result<Connection> {
        let conn = self
            .store
            .get_connection(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection '{id}' not found")))?;
        if conn.disabled {
            return Err(Error::Conflict(format!("connection '{id}' is disabled")));
        }
        Ok(conn)
    }

    async fn load_config(&self, conn: &Connection) -> Result<ConnectorConfig> {
        self.store
            .get_connector_config(&conn.connector_config_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "connector config '{}' not found",
                    conn.connector_config_id
                ))
            })
    }

    /// Execute one sync run.
    ///
    /// Transient and flush failures re-run the pipeline from the last persisted
    /// cursor, up to `max_run_attempts`; fatal adapter errors abort at once.
    /// Returns the finished run, or the final error once the run is recorded
    /// as failed.
    #[tracing::instrument(
        level = "info",
        skip(self, request, cancel),
        fields(
            source = %request.source_connection_id,
            destination = %request.destination_connection_id,
            run_id = tracing::field::Empty,
        )
    )]
    pub async fn run(&self, request: SyncRequest, cancel: CancellationToken) -> Result<SyncRun> {
        let mut run = SyncRun::new_running(&request, Utc::now())?;
        tracing::Span::current().record("run_id", tracing::field::display(run.run_id));
        self.resolve(&request).await?;
        self.store.upsert_sync_run(&run).await?;
        self.active.insert(run.run_id, cancel.clone());

        let max_attempts = self.config.max_run_attempts.max(1);
        let mut failure: Option<Error> = None;
        let mut status = RunStatus::Succeeded;

        loop {
            run.attempts += 1;
            match self.run_attempt(&request, &mut run, &cancel).await {
                Ok(AttemptOutcome::Completed) => break,
                Ok(AttemptOutcome::Cancelled) => {
                    status = RunStatus::Cancelled;
                    break;
                }
                Err(e) if e.is_retryable_run_failure() && run.attempts < max_attempts => {
                    let delay = self.config.retry_backoff(run.attempts - 1);
                    tracing::warn!(
                        attempt = run.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sync attempt failed; retrying from last committed cursor"
                    );
                    if let Err(store_err) = self.store.upsert_sync_run(&run).await {
                        tracing::warn!(
                            run_id = %run.run_id,
                            error = %store_err,
                            "failed to record sync attempt"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            status = RunStatus::Cancelled;
                            break;
                        }
                    }
                }
                Err(e) => {
                    status = RunStatus::Failed;
                    failure = Some(e);
                    break;
                }
            }
        }

        run.finish(status, failure.as_ref().map(|e| e.to_string()));
        self.active.remove(&run.run_id);
        let persisted = self.store.upsert_sync_run(&run).await;
        self.publish_run_event(&run).await;

        match status {
            RunStatus::Failed => {
                tracing::error!(
                    attempts = run.attempts,
                    commits = run.commits,
                    error = ?run.error_message,
                    operator_visible = failure.as_ref().is_some_and(Error::is_operator_visible),
                    "sync run failed"
                );
            }
            _ => tracing::info!(
                status = ?run.status,
                attempts = run.attempts,
                records = run.records,
                commits = run.commits,
                "sync run finished"
            ),
        }

        persisted?;
        match failure {
            Some(e) => Err(e),
            None => Ok(run),
        }
    }

    async fn run_attempt(
        &self,
        request: &SyncRequest,
        run: &mut SyncRun,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        if cancel.is_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }

        // Settings may have been patched by an earlier attempt (token refresh).
        let endpoints = &self.resolve(request).await?;

        let source_adapter = self.registry.source(&endpoints.source.connector_name)?;
        let destination_adapter = self
            .registry
            .destination(&endpoints.destination.connector_name)?;

        let state = self.store.get_sync_state(&endpoints.source.id).await?;
        let source = source_adapter.source_sync(SourceContext {
            connection: endpoints.source.clone(),
            config: endpoints.source_config.config.clone(),
            state,
            sync_mode: request.sync_mode,
            streams: request.streams.clone(),
            retry: self.config.adapter_retry_policy(),
        })?;
        let destination = destination_adapter.destination_sync(DestinationContext {
            connection: endpoints.destination.clone(),
            config: endpoints.destination_config.config.clone(),
            policy: self.config.batch_policy(),
            retry: self.config.adapter_retry_policy(),
        })?;

        let mut links: Vec<BoxLink> = vec![buffered_link(self.config.buffer_capacity)];
        if request.unify {
            links.push(unify_link(
                self.mappers.clone(),
                endpoints.source.connector_name.clone(),
            ));
        }
        links.extend(self.links.iter().map(|f| f(&endpoints.source)));
        links.push(destination);

        let mut stream = pipe(source, links);
        let mut staged_state: Vec<StateUpdate> = Vec::new();
        let mut staged_connection: Vec<ConnectionUpdate> = Vec::new();
        let mut staged_records = 0u64;

        while let Some(item) = stream.next().await {
            match item? {
                SyncOperation::Data(_) => staged_records += 1,
                SyncOperation::StateUpdate(update) => staged_state.push(update),
                SyncOperation::ConnectionUpdate(update) => staged_connection.push(update),
                SyncOperation::Commit => {
                    self.persist_commit(endpoints, &mut staged_state, &mut staged_connection)
                        .await?;
                    run.commits += 1;
                    run.records += std::mem::take(&mut staged_records);
                    if cancel.is_cancelled() {
                        tracing::info!(commits = run.commits, "cancellation observed at commit");
                        return Ok(AttemptOutcome::Cancelled);
                    }
                }
            }
        }

        if !staged_state.is_empty() || !staged_connection.is_empty() {
            tracing::warn!(
                state_updates = staged_state.len(),
                connection_updates = staged_connection.len(),
                "stream ended with uncommitted updates; discarding"
            );
        }
        Ok(AttemptOutcome::Completed)
    }

    async fn persist_commit(
        &self,
        endpoints: &Endpoints,
        staged_state: &mut Vec<StateUpdate>,
        staged_connection: &mut Vec<ConnectionUpdate>,
    ) -> Result<()> {
        for update in staged_state.drain(..) {
            tracing::debug!(stream_name = %update.stream_name, "persisting cursor");
            self.store
                .upsert_stream_state(&endpoints.source.id, &update.stream_name, update.state)
                .await?;
        }
        for update in staged_connection.drain(..) {
            let Some(mut conn) = self.store.get_connection(&update.connection_id).await? else {
                tracing::warn!(connection_id = %update.connection_id, "connection update for unknown connection");
                continue;
            };
            conn.apply_settings_patch(&update.patch);
            self.store.upsert_connection(&conn).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn publish_run_event(&self, run: &SyncRun) {
        let topic = match run.status {
            RunStatus::Succeeded => topics::RUN_SUCCEEDED,
            RunStatus::Failed => topics::RUN_FAILED,
            RunStatus::Cancelled => topics::RUN_CANCELLED,
            RunStatus::Running => return,
        };
        let payload = serde_json::json!({
            "run_id": run.run_id.to_string(),
            "source_connection_id": run.source_connection_id,
            "destination_connection_id": run.destination_connection_id,
            "status": run.status,
            "attempts": run.attempts,
            "records": run.records,
            "commits": run.commits,
            "error": run.error_message,
        });
        let event = Event::new(
            EventDirection::Outbound,
            topic,
            "system:coordinator",
            payload,
            format!("{topic}:{}", run.run_id),
            serde_json::json!({}),
            run.finished_at,
        );
        let published = match event {
            Ok(ev) => self.event_bus.publish(ev).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            tracing::warn!(error = %e, topic, "failed to publish run event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::error::ErrorContext;
    use crate::events::memory::MemoryEventBus;
    use crate::events::models::EventQuery;
    use crate::models::OrgId;
    use crate::source::{Page, PageFetcher, PageRecord, SourceAdapter, StreamSpec, iterate_entities};
    use crate::store::memory::MemorySyncStore;
    use crate::store::models::ListQuery;
    use crate::sync::link::tap_link;
    use crate::sync::operation::OpStream;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Pages addressed by index; the cursor after page `i` is `i + 1`.
    struct NumberedPages {
        pages: Vec<Vec<&'static str>>,
        fatal_at: Option<usize>,
    }

    #[async_trait]
    impl PageFetcher for NumberedPages {
        async fn fetch_page(&self, _: &StreamSpec, cursor: Option<&Value>) -> Result<Page> {
            let index = cursor.and_then(Value::as_u64).unwrap_or(0) as usize;
            if self.fatal_at == Some(index) {
                return Err(Error::fatal(ErrorContext::new("fake"), "401 unauthorized"));
            }
            let Some(ids) = self.pages.get(index) else {
                return Ok(Page {
                    records: Vec::new(),
                    next_cursor: None,
                    has_more: false,
                });
            };
            Ok(Page {
                records: ids
                    .iter()
                    .map(|id| PageRecord {
                        id: Some(id.to_string()),
                        data: json!({"id": id}),
                    })
                    .collect(),
                next_cursor: Some(json!(index + 1)),
                has_more: index + 1 < self.pages.len(),
            })
        }
    }

    struct FakeSource {
        fetcher: Arc<NumberedPages>,
    }

    impl SourceAdapter for FakeSource {
        fn connector_name(&self) -> &'static str {
            "fake"
        }

        fn streams(&self) -> Vec<StreamSpec> {
            vec![StreamSpec::named("contact")]
        }

        fn source_sync(&self, ctx: SourceContext) -> Result<OpStream> {
            let streams = ctx.select_streams(self.streams());
            Ok(iterate_entities(ctx, streams, self.fetcher.clone()))
        }
    }

    /// Rotates its access token on the first attempt, then fails transiently.
    struct RotatingSource {
        attempts: AtomicU32,
        seen_settings: Arc<Mutex<Vec<Value>>>,
    }

    impl SourceAdapter for RotatingSource {
        fn connector_name(&self) -> &'static str {
            "rotating"
        }

        fn streams(&self) -> Vec<StreamSpec> {
            vec![StreamSpec::named("contact")]
        }

        fn source_sync(&self, ctx: SourceContext) -> Result<OpStream> {
            self.seen_settings
                .lock()
                .unwrap()
                .push(ctx.connection.settings.clone());
            let ops = if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![
                    Ok(SyncOperation::connection_update(
                        ctx.connection.id.clone(),
                        json!({"access_token": "rotated"}),
                    )),
                    Ok(SyncOperation::Commit),
                    Err(Error::transient(ErrorContext::new("rotating"), "503")),
                ]
            } else {
                vec![Ok(SyncOperation::Commit)]
            };
            Ok(Box::pin(futures_util::stream::iter(ops)))
        }
    }

    struct Fixture {
        store: MemorySyncStore,
        destination: MemoryDestination,
        bus: Arc<MemoryEventBus>,
        registry: Arc<ConnectorRegistry>,
        config: EngineConfig,
        coordinator: SyncCoordinator,
        request: SyncRequest,
    }

    /// Fails the run-record write made between attempts.
    struct FailingAttemptRecords(MemorySyncStore);

    #[async_trait]
    impl SyncStore for FailingAttemptRecords {
        async fn upsert_connector_config(&self, config: &ConnectorConfig) -> Result<()> {
            self.0.upsert_connector_config(config).await
        }
        async fn get_connector_config(
            &self,
            id: &crate::models::ConnectorConfigId,
        ) -> Result<Option<ConnectorConfig>> {
            self.0.get_connector_config(id).await
        }
        async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
            self.0.upsert_connection(connection).await
        }
        async fn get_connection(
            &self,
            id: &crate::models::ConnectionId,
        ) -> Result<Option<Connection>> {
            self.0.get_connection(id).await
        }
        async fn find_connection_by_external_id(
            &self,
            connector_config_id: &crate::models::ConnectorConfigId,
            external_id: &str,
        ) -> Result<Option<Connection>> {
            self.0
                .find_connection_by_external_id(connector_config_id, external_id)
                .await
        }
        async fn list_connections(
            &self,
            connector_config_id: Option<&crate::models::ConnectorConfigId>,
            query: ListQuery,
        ) -> Result<Vec<Connection>> {
            self.0.list_connections(connector_config_id, query).await
        }
        async fn delete_connection(&self, id: &crate::models::ConnectionId) -> Result<()> {
            self.0.delete_connection(id).await
        }
        async fn get_sync_state(
            &self,
            connection_id: &crate::models::ConnectionId,
        ) -> Result<crate::store::models::SyncState> {
            self.0.get_sync_state(connection_id).await
        }
        async fn upsert_stream_state(
            &self,
            connection_id: &crate::models::ConnectionId,
            stream_name: &str,
            cursor: Value,
        ) -> Result<()> {
            self.0
                .upsert_stream_state(connection_id, stream_name, cursor)
                .await
        }
        async fn upsert_sync_run(&self, run: &SyncRun) -> Result<()> {
            if run.status == RunStatus::Running && run.attempts > 0 {
                return Err(Error::BackendMessage("run table unavailable".to_string()));
            }
            self.0.upsert_sync_run(run).await
        }
        async fn get_sync_run(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
            self.0.get_sync_run(run_id).await
        }
        async fn list_sync_runs(
            &self,
            connection_id: &crate::models::ConnectionId,
            query: ListQuery,
        ) -> Result<Vec<SyncRun>> {
            self.0.list_sync_runs(connection_id, query).await
        }
    }

    async fn fixture(pages: Vec<Vec<&'static str>>, fatal_at: Option<usize>) -> Fixture {
        let store = MemorySyncStore::new();
        let org = OrgId(Uuid::new_v4());
        let src_cfg = ConnectorConfig::new(org, "fake", json!({})).unwrap();
        let dst_cfg = ConnectorConfig::new(org, MemoryDestination::NAME, json!({})).unwrap();
        store.upsert_connector_config(&src_cfg).await.unwrap();
        store.upsert_connector_config(&dst_cfg).await.unwrap();
        let src = Connection::new(&src_cfg, None, None, json!({}));
        let dst = Connection::new(&dst_cfg, None, None, json!({}));
        store.upsert_connection(&src).await.unwrap();
        store.upsert_connection(&dst).await.unwrap();

        let destination = MemoryDestination::new();
        let mut registry = ConnectorRegistry::new();
        registry
            .register_source(Arc::new(FakeSource {
                fetcher: Arc::new(NumberedPages { pages, fatal_at }),
            }))
            .unwrap();
        registry
            .register_destination(Arc::new(destination.clone()))
            .unwrap();

        let registry = Arc::new(registry);
        let bus = Arc::new(MemoryEventBus::new());
        let config = EngineConfig {
            retry_backoff_base_ms: 10,
            retry_backoff_max_ms: 100,
            adapter_max_attempts: 1,
            ..EngineConfig::default()
        };
        let coordinator = SyncCoordinator::new(
            Arc::new(store.clone()),
            registry.clone(),
            bus.clone(),
            config.clone(),
        );
        Fixture {
            store,
            destination,
            bus,
            registry,
            config,
            coordinator,
            request: SyncRequest::new(src.id, dst.id).raw(),
        }
    }

    async fn topics_published(bus: &MemoryEventBus) -> Vec<String> {
        bus.query(EventQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_reruns_from_last_committed_cursor() {
        let fx = fixture(vec![vec!["a", "b"], vec!["c"]], None).await;
        fx.destination.fail_next_flushes(1).await;

        let run = fx
            .coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.records, 3);
        assert_eq!(run.commits, 2);
        assert_eq!(fx.destination.flush_sizes().await, vec![2, 1]);
        let writes: Vec<Value> = fx
            .store
            .state_writes()
            .await
            .into_iter()
            .map(|(_, _, cursor)| cursor)
            .collect();
        assert_eq!(writes, vec![json!(1), json!(2)]);
        assert_eq!(topics_published(&fx.bus).await, vec![topics::RUN_SUCCEEDED]);
        assert!(fx.coordinator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn fatal_error_keeps_committed_progress_and_fails_the_run() {
        let fx = fixture(vec![vec!["a"], vec!["b"], vec!["c"]], Some(1)).await;

        let err = fx
            .coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdapterFatal { .. }));

        let state = fx
            .store
            .get_sync_state(&fx.request.source_connection_id)
            .await
            .unwrap();
        assert_eq!(state.cursor("contact"), Some(&json!(1)));
        assert_eq!(fx.destination.flush_sizes().await, vec![1]);

        let runs = fx
            .store
            .list_sync_runs(&fx.request.source_connection_id, ListQuery::default())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].attempts, 1);
        assert!(runs[0].error_message.as_deref().is_some_and(|m| m.contains("401")));
        assert_eq!(topics_published(&fx.bus).await, vec![topics::RUN_FAILED]);
    }

    #[tokio::test]
    async fn cancellation_takes_effect_at_the_next_commit() {
        let fx = fixture(vec![vec!["a", "b"], vec!["c"], vec!["d"]], None).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let coordinator = fx.coordinator.with_link(Arc::new(move |_: &Connection| {
            let trigger = trigger.clone();
            let fired = fired.clone();
            tap_link(move |op| {
                if op.is_commit() && !fired.swap(true, Ordering::SeqCst) {
                    trigger.cancel();
                }
            })
        }));

        let run = coordinator.run(fx.request.clone(), cancel).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.commits, 1);
        assert_eq!(fx.destination.flush_sizes().await, vec![2]);
        let state = fx
            .store
            .get_sync_state(&fx.request.source_connection_id)
            .await
            .unwrap();
        assert_eq!(state.cursor("contact"), Some(&json!(1)));
        assert_eq!(topics_published(&fx.bus).await, vec![topics::RUN_CANCELLED]);
    }

    #[tokio::test]
    async fn second_run_resumes_from_persisted_cursor() {
        let fx = fixture(vec![vec!["a"], vec!["b"]], None).await;
        fx.coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.destination.flush_sizes().await, vec![1, 1]);

        // Resuming at cursor 2 finds an empty page: nothing new to load.
        let second = fx
            .coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.records, 0);
        assert_eq!(fx.destination.flush_sizes().await, vec![1, 1]);
        assert_eq!(fx.destination.rows().await.len(), 2);

        let full = fx
            .coordinator
            .run(fx.request.clone().full(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(full.records, 2);
        assert_eq!(fx.destination.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn disabled_connection_is_rejected() {
        let fx = fixture(vec![vec!["a"]], None).await;
        let mut src = fx
            .store
            .get_connection(&fx.request.source_connection_id)
            .await
            .unwrap()
            .unwrap();
        src.disabled = true;
        fx.store.upsert_connection(&src).await.unwrap();

        let err = fx
            .coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(fx.destination.flush_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn same_source_and_destination_is_invalid() {
        let fx = fixture(vec![vec!["a"]], None).await;
        let req = SyncRequest::new(
            fx.request.source_connection_id.clone(),
            fx.request.source_connection_id.clone(),
        );
        assert!(matches!(
            fx.coordinator.run(req, CancellationToken::new()).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn run_many_runs_each_request() {
        let fx = fixture(vec![vec!["a", "b"]], None).await;
        let results = fx
            .coordinator
            .run_many(vec![fx.request.clone(), fx.request.clone().full()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fx.destination.rows().await.len(), 2);
    }

    #[test]
    fn cancel_of_unknown_run_is_false() {
        let coordinator = SyncCoordinator::new(
            Arc::new(MemorySyncStore::new()),
            Arc::new(ConnectorRegistry::new()),
            Arc::new(MemoryEventBus::new()),
            EngineConfig::default(),
        );
        assert!(!coordinator.cancel_run(Uuid::new_v4()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_attempt_sees_settings_patched_by_the_previous_attempt() {
        let store = MemorySyncStore::new();
        let org = OrgId(Uuid::new_v4());
        let src_cfg = ConnectorConfig::new(org, "rotating", json!({})).unwrap();
        let dst_cfg = ConnectorConfig::new(org, MemoryDestination::NAME, json!({})).unwrap();
        store.upsert_connector_config(&src_cfg).await.unwrap();
        store.upsert_connector_config(&dst_cfg).await.unwrap();
        let src = Connection::new(&src_cfg, None, None, json!({"access_token": "old"}));
        let dst = Connection::new(&dst_cfg, None, None, json!({}));
        store.upsert_connection(&src).await.unwrap();
        store.upsert_connection(&dst).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ConnectorRegistry::new();
        registry
            .register_source(Arc::new(RotatingSource {
                attempts: AtomicU32::new(0),
                seen_settings: seen.clone(),
            }))
            .unwrap();
        registry
            .register_destination(Arc::new(MemoryDestination::new()))
            .unwrap();
        let coordinator = SyncCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(MemoryEventBus::new()),
            EngineConfig {
                retry_backoff_base_ms: 10,
                retry_backoff_max_ms: 100,
                ..EngineConfig::default()
            },
        );

        let run = coordinator
            .run(SyncRequest::new(src.id.clone(), dst.id).raw(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.attempts, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"access_token": "old"}), json!({"access_token": "rotated"})]
        );
        assert_eq!(
            store.get_connection(&src.id).await.unwrap().unwrap().settings,
            json!({"access_token": "rotated"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_attempt_does_not_stop_the_retry() {
        let fx = fixture(vec![vec!["a"], vec!["b"]], None).await;
        fx.destination.fail_next_flushes(1).await;
        let coordinator = SyncCoordinator::new(
            Arc::new(FailingAttemptRecords(fx.store.clone())),
            fx.registry.clone(),
            fx.bus.clone(),
            fx.config.clone(),
        );

        let run = coordinator
            .run(fx.request.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempts, 2);
        let stored = fx.store.get_sync_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }
}
