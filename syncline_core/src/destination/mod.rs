//! Destination adapters: commit-gated batching in front of a writer.

pub mod batcher;
pub mod memory;
pub mod traits;

pub use batcher::{CommitBatcher, batching_link};
pub use memory::MemoryDestination;
pub use traits::{Batch, BatchPolicy, BatchWriter, DestinationAdapter, DestinationContext};
