//! Syncline core library: operation model, links, mappers, adapter contracts,
//! connect flow and the sync coordinator.

pub mod config;
pub mod connect;
pub mod coordinator;
pub mod destination;
pub mod error;
pub mod events;
pub mod mapper;
pub mod models;
pub mod o11y;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod source;
pub mod store;
pub mod sync;

pub use config::EngineConfig;
pub use connect::{ConnectFlow, ConnectOutcome, ConnectService, ConnectSession, ConnectState};
pub use coordinator::{RunStatus, SyncCoordinator, SyncRequest, SyncRun};
pub use destination::{BatchPolicy, BatchWriter, DestinationAdapter, DestinationContext};
pub use error::{Error, ErrorContext, Result};
pub use models::{Connection, ConnectionId, ConnectorConfig, ConnectorConfigId, OrgId};
pub use registry::{ConnectorInfo, ConnectorRegistry};
pub use settings::ConnectorSettings;
pub use source::{Page, PageFetcher, PageRecord, SourceAdapter, SourceContext, StreamSpec, SyncMode};
pub use store::{MemorySyncStore, SyncState, SyncStore};
pub use sync::{BoxLink, DataOp, OpStream, SyncOperation};
