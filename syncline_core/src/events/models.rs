use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    /// Received from a third party (webhooks).
    Inbound,
    /// Emitted by the engine (run lifecycle).
    Outbound,
}

/// A durable event published on the `EventBus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// ULID (sortable by time).
    pub id: String,
    /// When the event occurred (domain timestamp).
    pub timestamp: DateTime<Utc>,
    /// When the engine received or emitted it.
    pub received_at: DateTime<Utc>,
    pub direction: EventDirection,
    /// Dot-delimited topic, e.g. "sync.run.failed" or "hubspot.contact.creation".
    pub topic: String,
    /// Emitter, e.g. "hubspot" or "system:coordinator".
    pub source: String,
    pub payload: serde_json::Value,
    /// Idempotency key for consumer-side dedupe.
    pub dedupe_key: String,
    /// Trace id, selected headers, etc.
    pub metadata: serde_json::Value,
}

impl Event {
    #[tracing::instrument(level = "debug", skip(payload, metadata))]
    pub fn new(
        direction: EventDirection,
        topic: impl Into<String> + std::fmt::Debug,
        source: impl Into<String> + std::fmt::Debug,
        payload: serde_json::Value,
        dedupe_key: impl Into<String> + std::fmt::Debug,
        metadata: serde_json::Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(Error::InvalidInput("event topic is empty".to_string()));
        }
        let source = source.into();
        if source.trim().is_empty() {
            return Err(Error::InvalidInput("event source is empty".to_string()));
        }
        let dedupe_key = dedupe_key.into();
        if dedupe_key.trim().is_empty() {
            return Err(Error::InvalidInput("event dedupe_key is empty".to_string()));
        }

        let now = Utc::now();
        Ok(Self {
            id: ulid::Ulid::new().to_string(),
            timestamp: timestamp.unwrap_or(now),
            received_at: now,
            direction,
            topic,
            source,
            payload,
            dedupe_key,
            metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    pub topic: Option<String>,
    pub source: Option<String>,
    pub direction: Option<EventDirection>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            topic: None,
            source: None,
            direction: None,
            since: None,
            limit: 100,
        }
    }
}

impl EventQuery {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > 10_000 {
            return Err(Error::InvalidInput(
                "event query limit must be in 1..=10000".to_string(),
            ));
        }
        Ok(())
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.topic.as_ref().is_none_or(|t| &event.topic == t)
            && self.source.as_ref().is_none_or(|s| &event.source == s)
            && self.direction.is_none_or(|d| event.direction == d)
            && self.since.is_none_or(|since| event.received_at >= since)
    }
}

/// Topics published by the sync coordinator.
pub mod topics {
    pub const RUN_SUCCEEDED: &str = "sync.run.succeeded";
    pub const RUN_FAILED: &str = "sync.run.failed";
    pub const RUN_CANCELLED: &str = "sync.run.cancelled";
}
