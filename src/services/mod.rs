//! Business logic services
//!
//! Glue between configuration, adapters and the sync engine, kept apart
//! from the CLI so it can be driven from tests.

mod sync_service;

pub use sync_service::*;
