pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod redaction;
pub mod retention;
pub mod sinks;
pub mod subject;

pub use error::{LedgerError, Result};
