//! imessage-sync - back up iMessage conversations to an IMAP mailbox
//!
//! Every run reads one or more message databases, skips what the
//! destination mailbox already holds and appends the rest as threaded
//! mail documents. Runs are idempotent: the source guid travels in a
//! provenance header and is read back on the next run.
//!
//! ## Module Organization
//!
//! - `types/`: Records, documents and the error type
//! - `sync/`: Merge, destination index, document building, run engine
//! - `adapters/`: Message database, attachment locator, contacts, IMAP
//! - `services/`: Wiring of config and adapters into a run
//! - `config/`: Configuration file

pub mod adapters;
pub mod config;
pub mod services;
pub mod sync;
pub mod types;

pub use services::{run_sync, SyncRequest};
pub use sync::SyncSummary;
pub use types::error::{Result, SyncError};
