//! Archival and export sinks
//!
//! Write-only collaborators that accept a redaction-applied view (a single
//! record for archival, a bundle for subject exports) and return a location
//! identifier.

pub mod file;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::ledger::RecordView;
use crate::subject::ExportBundle;

pub use file::FileSink;
pub use http::HttpSink;
pub use memory::MemorySink;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected write: {0}")]
    Rejected(String),

    #[error("sink I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Store a copy of the record's current view, returning its location
    async fn archive(&self, view: &RecordView) -> Result<String, SinkError>;
}

#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Store a subject export bundle, returning its location
    async fn write_export(&self, bundle: &ExportBundle) -> Result<String, SinkError>;
}

/// Run `op` up to `attempts` times, doubling the delay after each failure
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, SinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    let mut delay = base_delay;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "Sink write failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
