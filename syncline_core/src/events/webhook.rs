//! Inbound webhook ingestion.
//!
//! The host HTTP layer wraps a request as a `WebhookInput` and hands it to a
//! `WebhookDispatcher`; the connector's `WebhookHandler` turns it into typed
//! `WebhookEvent`s which are published on the `EventBus`. Raw HTTP never
//! reaches the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::EngineConfig;
use crate::events::models::{Event, EventDirection};
use crate::events::traits::EventBus;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-syncline-signature";

/// An inbound HTTP request, as seen by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookInput {
    pub trace_id: String,
    pub method: String,
    /// Header names are matched case-insensitively.
    pub headers: BTreeMap<String, String>,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookInput {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidInput(format!("invalid json body: {e}")))
    }
}

/// A typed event extracted from a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// e.g. "hubspot.contact.propertyChange".
    pub topic: String,
    /// External account the event belongs to (matches `Connection::external_id`).
    pub connection_external_id: Option<String>,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    fn connector_name(&self) -> &'static str;

    async fn handle_webhook(&self, input: &WebhookInput) -> Result<Vec<WebhookEvent>>;
}

#[derive(Debug, Clone)]
pub struct InboundWebhookConfig {
    pub signing_secret: Option<String>,
    pub max_payload_bytes: usize,
}

impl InboundWebhookConfig {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            signing_secret: cfg.webhook_signing_secret.clone(),
            max_payload_bytes: cfg.max_webhook_payload_bytes,
        }
    }
}

/// Routes webhooks to the handler registered for their connector.
pub struct WebhookDispatcher {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
    bus: Arc<dyn EventBus>,
    cfg: InboundWebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(bus: Arc<dyn EventBus>, cfg: InboundWebhookConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            bus,
            cfg,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn WebhookHandler>) -> Result<()> {
        let name = handler.connector_name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "webhook handler '{name}' already registered"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Verify, parse and publish one webhook. Returns the published event ids.
    #[tracing::instrument(level = "debug", skip(self, input), fields(trace_id = %input.trace_id))]
    pub async fn dispatch(&self, connector_name: &str, input: WebhookInput) -> Result<Vec<String>> {
        if input.body.len() > self.cfg.max_payload_bytes {
            return Err(Error::InvalidInput(format!(
                "webhook payload of {} bytes exceeds limit of {}",
                input.body.len(),
                self.cfg.max_payload_bytes
            )));
        }
        if let Some(secret) = &self.cfg.signing_secret {
            let Some(sig) = input.header(SIGNATURE_HEADER) else {
                return Err(Error::Unauthorized("missing webhook signature".to_string()));
            };
            verify_signature(secret, sig, &input.body)?;
        }

        let handler = self.handlers.get(connector_name).ok_or_else(|| {
            Error::NotFound(format!("no webhook handler for connector '{connector_name}'"))
        })?;
        let events = handler.handle_webhook(&input).await?;

        let mut ids = Vec::with_capacity(events.len());
        for ev in events {
            let metadata = serde_json::json!({
                "trace_id": input.trace_id,
                "path": input.path,
                "connection_external_id": ev.connection_external_id,
            });
            let event = Event::new(
                EventDirection::Inbound,
                ev.topic,
                connector_name,
                ev.payload,
                ev.dedupe_key,
                metadata,
                None,
            )?;
            ids.push(self.bus.publish(event).await?);
        }
        tracing::debug!(connector = connector_name, published = ids.len(), "webhook dispatched");
        Ok(ids)
    }
}

/// Verify an HMAC-SHA256 signature given as raw hex or `sha256=<hex>`.
#[tracing::instrument(level = "debug", skip(secret, body))]
pub fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> Result<()> {
    let sig = signature_header.trim();
    let sig_hex = sig.strip_prefix("sha256=").unwrap_or(sig);
    let provided = hex::decode(sig_hex)
        .map_err(|_| Error::Unauthorized("malformed webhook signature".to_string()))?;

    // `verify_slice` compares in constant time.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Unauthorized("invalid signing secret".to_string()))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| Error::Unauthorized("webhook signature mismatch".to_string()))
}

/// Signature header value for `body`: `sha256=<hex>`.
#[tracing::instrument(level = "debug", skip(secret, body))]
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Unauthorized("invalid signing secret".to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
