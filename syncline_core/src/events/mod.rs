pub mod memory;
pub mod models;
pub mod traits;
pub mod webhook;

pub use memory::MemoryEventBus;
pub use models::{Event, EventDirection, EventQuery, topics};
pub use traits::EventBus;
pub use webhook::{
    InboundWebhookConfig, WebhookDispatcher, WebhookEvent, WebhookHandler, WebhookInput,
    sign_body, verify_signature,
};
