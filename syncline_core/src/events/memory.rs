use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::events::models::{Event, EventQuery};
use crate::events::traits::EventBus;
use crate::{Error, Result};

/// In-memory EventBus for local development and unit tests.
///
/// At-least-once is approximated by keeping every event for the process lifetime;
/// consumers read with `query`.
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a snapshot of all events (primarily for tests).
    pub async fn all_events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> Result<String> {
        if event.topic.trim().is_empty() {
            return Err(Error::InvalidInput("event topic is empty".to_string()));
        }
        let id = event.id.clone();
        self.events.lock().await.push(event);
        Ok(id)
    }

    async fn query(&self, filter: EventQuery) -> Result<Vec<Event>> {
        filter.validate()?;
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|e| filter.matches(e))
            .take(filter.limit)
            .cloned()
            .collect())
    }
}
