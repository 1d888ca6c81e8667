pub mod engine;
pub mod models;

pub use engine::{LinkFactory, SyncCoordinator};
pub use models::{RunStatus, SyncRequest, SyncRun};
