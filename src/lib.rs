// Library module for fieldsync
// Re-exports modules for use in integration tests and the CLI

pub mod api;
pub mod config;
pub mod error;
pub mod fs;
pub mod sync;

pub use error::{Result, SyncError};
