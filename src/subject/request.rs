//! Subject request state machine
//!
//! `pending -> processing -> {completed, failed}`, plus `pending -> failed`
//! for operator cancellation before a worker picks the request up. Terminal
//! requests never move again; a failed request is resubmitted as a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Export,
    Delete,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Export => "export",
            RequestType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRequest {
    pub id: Uuid,
    /// Identifier of the data subject; never written to the ledger
    pub subject: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Export location (export requests)
    pub result_location: Option<String>,
    /// Records that received new tombstones (delete requests)
    pub redaction_count: Option<u64>,
    pub failure_reason: Option<String>,
    /// Ledger tail when processing began; later records are out of scope
    pub processing_bound: Option<u64>,
}

impl SubjectRequest {
    pub fn new(subject: impl Into<String>, request_type: RequestType) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            request_type,
            status: RequestStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result_location: None,
            redaction_count: None,
            failure_reason: None,
            processing_bound: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: RequestStatus) -> Result<RequestStatus> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }

    pub(crate) fn start(&mut self, processing_bound: u64) -> Result<()> {
        self.transition(RequestStatus::Processing)?;
        self.started_at = Some(Utc::now());
        self.processing_bound = Some(processing_bound);
        Ok(())
    }

    pub(crate) fn complete_export(&mut self, location: String) -> Result<()> {
        self.transition(RequestStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result_location = Some(location);
        Ok(())
    }

    pub(crate) fn complete_delete(&mut self, redaction_count: u64) -> Result<()> {
        self.transition(RequestStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.redaction_count = Some(redaction_count);
        Ok(())
    }

    /// Returns the status the request left
    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> Result<RequestStatus> {
        let previous = self.transition(RequestStatus::Failed)?;
        self.failed_at = Some(Utc::now());
        self.failure_reason = Some(reason.into());
        Ok(previous)
    }
}
