//! Ledger Verification
//!
//! Recomputes the hash chain over a range of records from their stored
//! content hashes. Redaction overlays never affect the result: the chain is
//! built from hashes captured at append time, not from live field values.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::{self, CanonicalFields};
use crate::ledger::record::GENESIS_SEED;
use crate::ledger::store::LedgerStore;

/// Kind of integrity violation found by the verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityFault {
    /// Records missing or out of order
    SequenceGap { expected: u64, found: u64 },
    /// The record at the range start's predecessor is missing
    MissingRecord { sequence: u64 },
    ChainMismatch { expected: String, stored: String },
    /// Deep check only: live fields no longer hash to the stored content hash
    ContentMismatch { expected: String, stored: String },
    TimestampRegression,
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFault::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {}, found {}", expected, found)
            }
            IntegrityFault::MissingRecord { sequence } => {
                write!(f, "record {} is missing", sequence)
            }
            IntegrityFault::ChainMismatch { expected, stored } => {
                write!(f, "chain hash mismatch: expected {}, stored {}", expected, stored)
            }
            IntegrityFault::ContentMismatch { expected, stored } => {
                write!(
                    f,
                    "content hash mismatch: recomputed {}, stored {}",
                    expected, stored
                )
            }
            IntegrityFault::TimestampRegression => f.write_str("timestamp earlier than predecessor"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOptions {
    /// Also recompute content hashes of records that carry no overlay
    pub deep: bool,
}

/// Verification result with detailed information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub from: u64,
    pub to: u64,
    pub records_checked: u64,
    pub content_checked: u64,
    pub redacted_skipped: u64,
    pub last_chain_hash: String,
}

impl VerificationReport {
    pub fn summary(&self) -> String {
        if self.records_checked == 0 {
            return "Ledger range is empty".to_string();
        }
        format!(
            "Ledger range {}..={} is valid ({} records, {} content hashes recomputed, {} redacted)",
            self.from, self.to, self.records_checked, self.content_checked, self.redacted_skipped
        )
    }
}

#[derive(Clone)]
pub struct Verifier {
    store: LedgerStore,
}

impl Verifier {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Chain check over `[from_seq, to_seq]`
    pub fn verify(&self, from_seq: u64, to_seq: u64) -> Result<VerificationReport> {
        self.verify_with(from_seq, to_seq, VerifyOptions::default())
    }

    /// Check the range, returning the first offending sequence as a
    /// `ChainIntegrity` error. Sequence 0 is treated as 1 and ranges past the
    /// tail are clamped.
    pub fn verify_with(
        &self,
        from_seq: u64,
        to_seq: u64,
        options: VerifyOptions,
    ) -> Result<VerificationReport> {
        let tail = self.store.tail();
        let from = from_seq.max(1);
        let to = to_seq.min(tail.sequence);

        let mut previous_hash = if from == 1 {
            GENESIS_SEED.to_string()
        } else {
            match self.store.get(from - 1) {
                Some(anchor) => anchor.chain_hash().to_string(),
                None => {
                    return Err(fault(from - 1, IntegrityFault::MissingRecord {
                        sequence: from - 1,
                    }))
                }
            }
        };

        let mut report = VerificationReport {
            from,
            to,
            records_checked: 0,
            content_checked: 0,
            redacted_skipped: 0,
            last_chain_hash: previous_hash.clone(),
        };
        if from > to {
            return Ok(report);
        }

        let mut expected_sequence = from;
        let mut previous_timestamp = None;

        for record in self.store.read_range(from, to) {
            if record.sequence() != expected_sequence {
                return Err(fault(
                    expected_sequence,
                    IntegrityFault::SequenceGap {
                        expected: expected_sequence,
                        found: record.sequence(),
                    },
                ));
            }

            let expected_chain = canonical::chain_hash(&previous_hash, record.content_hash());
            if expected_chain != record.chain_hash() {
                return Err(fault(
                    record.sequence(),
                    IntegrityFault::ChainMismatch {
                        expected: expected_chain,
                        stored: record.chain_hash().to_string(),
                    },
                ));
            }

            if options.deep {
                if record.is_redacted() {
                    report.redacted_skipped += 1;
                } else {
                    let recomputed = canonical::content_hash(&CanonicalFields::of_record(&record))?;
                    if recomputed != record.content_hash() {
                        return Err(fault(
                            record.sequence(),
                            IntegrityFault::ContentMismatch {
                                expected: recomputed,
                                stored: record.content_hash().to_string(),
                            },
                        ));
                    }
                    report.content_checked += 1;
                }
            }

            if previous_timestamp.map_or(false, |prev| record.timestamp() < prev) {
                return Err(fault(record.sequence(), IntegrityFault::TimestampRegression));
            }

            previous_timestamp = Some(record.timestamp());
            previous_hash = record.chain_hash().to_string();
            expected_sequence += 1;
            report.records_checked += 1;
        }

        if expected_sequence <= to {
            return Err(fault(
                expected_sequence,
                IntegrityFault::MissingRecord {
                    sequence: expected_sequence,
                },
            ));
        }

        report.last_chain_hash = previous_hash;
        info!("{}", report.summary());
        Ok(report)
    }
}

fn fault(sequence: u64, fault: IntegrityFault) -> LedgerError {
    error!("Ledger integrity fault at sequence {}: {}", sequence, fault);
    LedgerError::ChainIntegrity { sequence, fault }
}

/// Sequence number of the first fault, if any
pub fn first_fault(result: &Result<VerificationReport>) -> Option<u64> {
    match result {
        Err(LedgerError::ChainIntegrity { sequence, .. }) => Some(*sequence),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::{
        ActionKind, ActorRef, EventCandidate, FieldPath, RedactionOverlay, Target, Tombstone,
    };

    async fn ledger_with(n: u64) -> LedgerStore {
        let store = LedgerStore::in_memory();
        for i in 1..=n {
            store
                .append(
                    EventCandidate::new(
                        ActorRef::principal("staff-1"),
                        ActionKind::Create,
                        Target::new("Pet", i.to_string()),
                    )
                    .with_change("owner_email", "", format!("owner{}@x.com", i)),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_verify_clean_ledger() {
        let store = ledger_with(5).await;
        let verifier = Verifier::new(store.clone());

        let report = verifier.verify(0, u64::MAX).unwrap();
        assert_eq!(report.records_checked, 5);
        assert_eq!(report.last_chain_hash, store.tail().chain_hash);

        let partial = verifier.verify(3, 4).unwrap();
        assert_eq!(partial.records_checked, 2);
    }

    #[tokio::test]
    async fn test_verify_empty_range() {
        let store = LedgerStore::in_memory();
        let report = Verifier::new(store).verify(0, 10).unwrap();
        assert_eq!(report.records_checked, 0);
    }

    #[tokio::test]
    async fn test_corrupted_chain_hash_is_located() {
        let store = ledger_with(5).await;
        store.corrupt_record(3, |r| r.corrupt_chain_hash("sha256:forged"));

        let result = Verifier::new(store).verify(1, 5);
        assert_eq!(first_fault(&result), Some(3));
    }

    #[tokio::test]
    async fn test_corrupted_content_hash_is_located() {
        let store = ledger_with(4).await;
        store.corrupt_record(2, |r| r.corrupt_content_hash("sha256:forged"));

        let result = Verifier::new(store).verify(1, 4);
        assert_eq!(first_fault(&result), Some(2));
    }

    #[tokio::test]
    async fn test_redaction_does_not_break_chain() {
        let store = ledger_with(3).await;
        let mut overlay = RedactionOverlay::new();
        overlay.insert(
            FieldPath::diff("owner_email"),
            Tombstone::new("gdpr", ActorRef::principal("dpo")),
        );
        store.apply_redaction(2, overlay).await.unwrap();

        let verifier = Verifier::new(store);
        assert!(verifier.verify(1, 3).is_ok());

        let deep = verifier
            .verify_with(1, 3, VerifyOptions { deep: true })
            .unwrap();
        assert_eq!(deep.content_checked, 2);
        assert_eq!(deep.redacted_skipped, 1);
    }
}
