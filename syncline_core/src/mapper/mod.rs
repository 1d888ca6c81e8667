//! Unified mappers: pure, total functions from raw connector payloads to
//! cross-connector records.

pub mod mapping;
pub mod registry;
pub mod unified;

pub use mapping::{FieldMapping, first_of, get_path, pluck};
pub use registry::{EntityMapper, MapperRegistry, unify_link};
pub use unified::UnifiedEntityName;
