use async_trait::async_trait;

use crate::Result;
use crate::events::models::{Event, EventQuery};

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event (inbound or outbound).
    ///
    /// Implementations must provide at-least-once delivery.
    async fn publish(&self, event: Event) -> Result<String>; // event_id

    /// Query events (for replay, debugging, audit).
    async fn query(&self, filter: EventQuery) -> Result<Vec<Event>>;
}
