//! Export bundle written for subject access requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::{merkle_root, RecordView, Tail};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub request_id: Uuid,
    pub subject: String,
    pub generated_at: DateTime<Utc>,
    /// Ledger head the export was taken against
    pub ledger_tail: Tail,
    /// Redaction-applied views, ascending by sequence
    pub records: Vec<RecordView>,
    /// Merkle root over the exported records' chain hashes
    pub merkle_root: Option<String>,
}

impl ExportBundle {
    pub fn build(
        request_id: Uuid,
        subject: &str,
        ledger_tail: Tail,
        records: Vec<RecordView>,
    ) -> Result<Self> {
        let merkle_root = if records.is_empty() {
            None
        } else {
            let hashes: Vec<&str> = records.iter().map(|r| r.chain_hash.as_str()).collect();
            Some(merkle_root(&hashes)?)
        };

        Ok(Self {
            request_id,
            subject: subject.to_string(),
            generated_at: Utc::now(),
            ledger_tail,
            records,
            merkle_root,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
