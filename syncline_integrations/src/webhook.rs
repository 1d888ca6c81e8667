//! Webhook destination: each committed batch is POSTed as one signed JSON request.
//!
//! The request carries an `x-syncline-batch-id` derived from the batch content,
//! so a receiver can drop replays of a batch that was delivered before a
//! failed run was retried.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};
use syncline_core::destination::{
    Batch, BatchWriter, DestinationAdapter, DestinationContext, batching_link,
};
use syncline_core::error::ErrorContext;
use syncline_core::events::webhook::{SIGNATURE_HEADER, sign_body};
use syncline_core::retry::{RetryPolicy, retry_transient};
use syncline_core::settings::{ConnectorSettings, require_non_empty};
use syncline_core::sync::{BoxLink, row_id};
use syncline_core::{Error, Result};

use crate::http::{build_client, send};

pub const NAME: &str = "webhook";
pub const BATCH_ID_HEADER: &str = "x-syncline-batch-id";

/// Destination settings (`Connection::settings`).
#[derive(Clone, Deserialize)]
pub struct WebhookDestinationSettings {
    pub url: String,
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl fmt::Debug for WebhookDestinationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDestinationSettings")
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ConnectorSettings for WebhookDestinationSettings {
    fn check(&self) -> Result<()> {
        require_non_empty("url", &self.url)?;
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::Validation(format!(
                "webhook url must be http(s): {}",
                self.url
            )));
        }
        Ok(())
    }
}

/// JSON body for one batch. State updates stay with the engine.
pub fn batch_payload(batch: &Batch) -> Value {
    let records: Vec<Value> = batch
        .data
        .iter()
        .map(|op| {
            json!({
                "id": op.id,
                "entity_name": op.entity_name,
                "connection_id": op.connection_id,
                "raw": op.entity.raw,
                "unified": op.entity.unified,
            })
        })
        .collect();
    let connection_updates: Vec<Value> = batch
        .connection_updates
        .iter()
        .map(|u| json!({"connection_id": u.connection_id}))
        .collect();
    json!({
        "records": records,
        "connection_updates": connection_updates,
    })
}

/// Content-derived id: the same batch replayed gets the same id.
pub fn batch_id(payload: &Value) -> String {
    row_id(payload)
}

struct WebhookWriter {
    client: Client,
    settings: WebhookDestinationSettings,
    context: ErrorContext,
    retry: RetryPolicy,
}

impl WebhookWriter {
    async fn post_once(&self, body: &[u8], batch_id: &str) -> Result<()> {
        let mut req = self
            .client
            .post(&self.settings.url)
            .header(CONTENT_TYPE, "application/json")
            .header(BATCH_ID_HEADER, batch_id)
            .body(body.to_vec());
        for (k, v) in &self.settings.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(secret) = &self.settings.signing_secret {
            req = req.header(SIGNATURE_HEADER, sign_body(secret, body)?);
        }
        send(req, &self.context).await.map(|_| ())
    }
}

#[async_trait]
impl BatchWriter for WebhookWriter {
    #[tracing::instrument(level = "debug", skip_all, fields(context = %self.context, records = batch.data.len()))]
    async fn flush(&self, batch: &Batch) -> Result<()> {
        let payload = batch_payload(batch);
        let id = batch_id(&payload);
        let body = serde_json::to_vec(&payload).map_err(|e| Error::backend("encode webhook batch", e))?;
        retry_transient(&self.retry, &self.context, || self.post_once(&body, &id))
            .await
            .map_err(|e| Error::flush(self.context.clone(), e.to_string()))
    }
}

pub struct WebhookDestination {
    client: Client,
}

impl WebhookDestination {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

impl DestinationAdapter for WebhookDestination {
    fn connector_name(&self) -> &'static str {
        NAME
    }

    #[tracing::instrument(level = "info", skip_all, fields(connection_id = %ctx.connection.id))]
    fn destination_sync(&self, ctx: DestinationContext) -> Result<BoxLink> {
        let settings = WebhookDestinationSettings::validate(&ctx.connection.settings)?;
        let context = ctx.error_context();
        let writer = WebhookWriter {
            client: self.client.clone(),
            settings,
            context: context.clone(),
            retry: ctx.retry,
        };
        Ok(batching_link(Arc::new(writer), ctx.policy, context))
    }
}
