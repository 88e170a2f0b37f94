pub mod document_builder;
pub mod engine;
pub mod index;
pub mod merger;
pub mod mime;
pub mod thread_tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use document_builder::DocumentBuilder;
pub use engine::{SyncEngine, SyncOptions, SyncPhase, SyncSummary};
pub use index::{DestinationIndex, IndexStrategy};
pub use merger::merge_records;
pub use thread_tracker::ThreadTracker;
