use thiserror::Error;
use uuid::Uuid;

use crate::ledger::canonical::EncodingError;
use crate::ledger::verify::IntegrityFault;
use crate::sinks::SinkError;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Journal(format!("JSON serialization error: {}", err))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Journal(format!("I/O error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record not found: sequence {sequence}")]
    NotFound { sequence: u64 },

    #[error("Fields already redacted on sequence {sequence}: {}", .fields.join(", "))]
    AlreadyRedacted { sequence: u64, fields: Vec<String> },

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Chain integrity violated at sequence {sequence}: {fault}")]
    ChainIntegrity { sequence: u64, fault: IntegrityFault },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subject request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("Invalid subject request transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Conditions the redaction paths treat as success.
    pub fn is_already_redacted(&self) -> bool {
        matches!(self, Self::AlreadyRedacted { .. })
    }
}
