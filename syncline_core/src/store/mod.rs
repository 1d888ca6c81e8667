pub mod memory;
pub mod models;
pub mod traits;

pub use memory::MemorySyncStore;
pub use models::{ListQuery, SyncState};
pub use traits::SyncStore;
