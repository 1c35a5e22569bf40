//! Merkle Root for Ledger Ranges
//!
//! Builds a Merkle root over the chain hashes of a range of records so a
//! range can be anchored externally or embedded in an export bundle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::ledger::record::AuditRecord;

fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Merkle root over leaf hashes; an odd node is paired with itself
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> Result<String> {
    if leaves.is_empty() {
        return Err(LedgerError::validation(
            "Cannot build Merkle root from empty range",
        ));
    }

    let mut level: VecDeque<String> = leaves.iter().map(|l| l.as_ref().to_string()).collect();

    while level.len() > 1 {
        let mut next = VecDeque::with_capacity((level.len() + 1) / 2);
        while let Some(left) = level.pop_front() {
            let right = level.pop_front().unwrap_or_else(|| left.clone());
            next.push_back(combine(&left, &right));
        }
        level = next;
    }

    let root = level.pop_front().unwrap_or_default();
    debug!("Merkle root over {} leaves: {}", leaves.len(), root);
    Ok(root)
}

/// Merkle root over the chain hashes of `records`
pub fn records_root(records: &[AuditRecord]) -> Result<String> {
    let leaves: Vec<&str> = records.iter().map(AuditRecord::chain_hash).collect();
    merkle_root(&leaves)
}

pub fn verify_merkle_root(records: &[AuditRecord], claimed_root: &str) -> Result<bool> {
    Ok(records_root(records)? == claimed_root)
}

/// Anchorable summary of a ledger range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCheckpoint {
    pub from: u64,
    pub to: u64,
    pub record_count: usize,
    pub first_chain_hash: String,
    pub last_chain_hash: String,
    pub merkle_root: String,
}

impl RangeCheckpoint {
    pub fn from_records(records: &[AuditRecord]) -> Result<Self> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(LedgerError::validation(
                    "Cannot checkpoint an empty range",
                ))
            }
        };

        Ok(Self {
            from: first.sequence(),
            to: last.sequence(),
            record_count: records.len(),
            first_chain_hash: first.chain_hash().to_string(),
            last_chain_hash: last.chain_hash().to_string(),
            merkle_root: records_root(records)?,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "Records {}..={}: {} entries, root: {}",
            self.from, self.to, self.record_count, self.merkle_root
        )
    }
}
