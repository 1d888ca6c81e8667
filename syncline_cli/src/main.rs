mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands, Endpoint, JobFile};
use syncline_core::connect::TokenBroker;
use syncline_core::events::MemoryEventBus;
use syncline_core::models::{Connection, ConnectorConfig, OrgId};
use syncline_core::store::{MemorySyncStore, SyncState, SyncStore};
use syncline_core::{ConnectorRegistry, EngineConfig, SyncCoordinator, SyncRequest};
use syncline_integrations::token_broker::HttpTokenBroker;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    syncline_core::o11y::init_tracing_from_env()?;
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let timeout = Duration::from_millis(config.request_timeout_ms);

    match cli.command {
        Commands::Connectors => {
            let mut registry = ConnectorRegistry::new();
            syncline_integrations::register_defaults(&mut registry, None, timeout)?;
            println!("{}", serde_json::to_string_pretty(&registry.connectors())?);
        }
        Commands::Sync {
            job,
            state_file,
            full,
            database_url,
            token_broker_url,
        } => {
            let job_path = job;
            let job = JobFile::parse(&tokio::fs::read_to_string(&job_path).await?)?;

            let broker: Option<Arc<dyn TokenBroker>> = match token_broker_url {
                Some(url) => Some(Arc::new(HttpTokenBroker::new(url, timeout)?)),
                None => None,
            };
            let mut registry = ConnectorRegistry::new();
            syncline_integrations::register_defaults(&mut registry, broker, timeout)?;
            #[cfg(feature = "postgres")]
            {
                if job.destination.connector == syncline_integrations::postgres::NAME {
                    register_postgres(&mut registry, database_url.as_deref(), job.table.as_deref())
                        .await?;
                }
            }
            #[cfg(not(feature = "postgres"))]
            let _ = database_url;

            let store = MemorySyncStore::new();
            let org = OrgId(Uuid::new_v4());
            let source = seed_connection(&store, org, &job.source).await?;
            let destination = seed_connection(&store, org, &job.destination).await?;
            if let Some(path) = &state_file
                && let Some(mut state) = read_state(path).await?
            {
                state.connection_id = source.id.clone();
                store.seed_state(state).await;
            }

            let coordinator = SyncCoordinator::new(
                Arc::new(store.clone()),
                Arc::new(registry),
                Arc::new(MemoryEventBus::new()),
                config,
            );
            let mut request = SyncRequest::new(source.id.clone(), destination.id.clone());
            request.streams = job.streams.clone();
            request.unify = job.unify;
            if full {
                request = request.full();
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received; stopping at the next commit");
                    on_signal.cancel();
                }
            });

            let outcome = coordinator.run(request, cancel).await;

            // Committed cursors are kept even when the run failed.
            if let Some(path) = &state_file {
                let state = store.get_sync_state(&source.id).await?;
                tokio::fs::write(path, serde_json::to_vec_pretty(&state)?).await?;
            }
            let refreshed = store
                .get_connection(&source.id)
                .await?
                .map(|c| c.settings)
                .filter(|settings| *settings != source.settings);
            let settings_updated = refreshed.is_some();
            if let Some(settings) = refreshed {
                write_source_settings(&job_path, settings).await?;
                tracing::info!(job = %job_path.display(), "stored refreshed source settings in the job file");
            }

            let run = outcome?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "run_id": run.run_id.to_string(),
                    "status": run.status,
                    "attempts": run.attempts,
                    "records": run.records,
                    "commits": run.commits,
                    "duration_ms": run.duration_ms(),
                    "settings_updated": settings_updated,
                }))?
            );
        }
    }

    Ok(())
}

async fn seed_connection(
    store: &MemorySyncStore,
    org: OrgId,
    endpoint: &Endpoint,
) -> anyhow::Result<Connection> {
    let config = ConnectorConfig::new(org, endpoint.connector.clone(), endpoint.config.clone())?;
    store.upsert_connector_config(&config).await?;
    let connection = Connection::new(
        &config,
        None,
        endpoint.external_id.clone(),
        endpoint.settings.clone(),
    );
    store.upsert_connection(&connection).await?;
    Ok(connection)
}

#[cfg(feature = "postgres")]
async fn register_postgres(
    registry: &mut ConnectorRegistry,
    database_url: Option<&str>,
    table: Option<&str>,
) -> anyhow::Result<()> {
    use syncline_integrations::postgres::{DEFAULT_TABLE, PostgresDestination};

    let Some(url) = database_url else {
        anyhow::bail!("the postgres destination needs --database-url or DATABASE_URL");
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;
    registry.register_destination(Arc::new(PostgresDestination::new(
        pool,
        table.unwrap_or(DEFAULT_TABLE),
    )?))?;
    Ok(())
}

async fn write_source_settings(path: &Path, settings: serde_json::Value) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path).await?;
    tokio::fs::write(path, cli::with_source_settings(&raw, settings)?).await?;
    Ok(())
}

async fn read_state(path: &Path) -> anyhow::Result<Option<SyncState>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
