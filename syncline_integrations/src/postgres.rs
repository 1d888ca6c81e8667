//! Postgres destination.
//!
//! Every batch is written in one transaction, upserting on
//! `(connection_id, entity_name, id)`, so replaying a batch after a failed run
//! leaves the table unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use syncline_core::destination::{
    Batch, BatchWriter, DestinationAdapter, DestinationContext, batching_link,
};
use syncline_core::error::ErrorContext;
use syncline_core::sync::BoxLink;
use syncline_core::{Error, Result};
use tokio::sync::OnceCell;

pub const NAME: &str = "postgres";
pub const DEFAULT_TABLE: &str = "syncline_records";

fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(Error::Validation(format!(
            "invalid postgres table name '{table}'"
        )));
    }
    Ok(())
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    connection_id TEXT NOT NULL,
    entity_name TEXT NOT NULL,
    id TEXT NOT NULL,
    raw JSONB NOT NULL,
    unified JSONB,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (connection_id, entity_name, id)
)
"#
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
INSERT INTO {table}
  (connection_id, entity_name, id, raw, unified)
VALUES
  ($1, $2, $3, $4, $5)
ON CONFLICT (connection_id, entity_name, id) DO UPDATE
  SET raw = EXCLUDED.raw,
      unified = EXCLUDED.unified,
      updated_at = NOW()
"#
    )
}

struct Shared {
    pool: PgPool,
    table: String,
    initialized: OnceCell<()>,
}

impl Shared {
    #[tracing::instrument(level = "info", skip(self), fields(table = %self.table))]
    async fn ensure_schema(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                sqlx::query(&create_table_sql(&self.table))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::backend("postgres destination migrate", e))?;
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }
}

/// Loads records into one table of a Postgres database.
#[derive(Clone)]
pub struct PostgresDestination {
    shared: Arc<Shared>,
}

impl PostgresDestination {
    #[tracing::instrument(level = "debug", skip(pool))]
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                table: table.to_string(),
                initialized: OnceCell::new(),
            }),
        })
    }
}

struct PostgresWriter {
    shared: Arc<Shared>,
    context: ErrorContext,
}

impl PostgresWriter {
    async fn write(&self, batch: &Batch) -> std::result::Result<(), sqlx::Error> {
        let sql = upsert_sql(&self.shared.table);
        let mut tx = self.shared.pool.begin().await?;
        for op in &batch.data {
            sqlx::query(&sql)
                .bind(op.connection_id.as_str())
                .bind(&op.entity_name)
                .bind(&op.id)
                .bind(&op.entity.raw)
                .bind(&op.entity.unified)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl BatchWriter for PostgresWriter {
    #[tracing::instrument(level = "debug", skip_all, fields(context = %self.context, records = batch.data.len()))]
    async fn flush(&self, batch: &Batch) -> Result<()> {
        if batch.data.is_empty() {
            return Ok(());
        }
        self.shared
            .ensure_schema()
            .await
            .map_err(|e| Error::flush(self.context.clone(), e.to_string()))?;
        // A dropped transaction rolls back, so a failed write applies nothing.
        self.write(batch)
            .await
            .map_err(|e| Error::flush(self.context.clone(), format!("postgres write failed: {e}")))
    }
}

impl DestinationAdapter for PostgresDestination {
    fn connector_name(&self) -> &'static str {
        NAME
    }

    fn destination_sync(&self, ctx: DestinationContext) -> Result<BoxLink> {
        let context = ctx.error_context();
        let writer = PostgresWriter {
            shared: self.shared.clone(),
            context: context.clone(),
        };
        Ok(batching_link(Arc::new(writer), ctx.policy, context))
    }
}
