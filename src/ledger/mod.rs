//! Ledger
//!
//! Append-only, tamper-evident record store with a SHA-256 hash chain,
//! redaction overlays, and range verification.

pub mod canonical;
pub mod journal;
pub mod link;
pub mod merkle;
pub mod record;
pub mod store;
pub mod verify;

pub use canonical::{encode, CanonicalFields, EncodingError};
pub use link::SubjectLinker;
pub use merkle::{merkle_root, RangeCheckpoint};
pub use record::{
    ActionKind, ActorRef, AuditRecord, DiffPayload, EventCandidate, FieldChange, FieldPath,
    FieldValue, OriginMetadata, RecordView, RedactionOverlay, Sensitivity, Target, Tombstone,
    Viewed, GENESIS_SEED, SYSTEM_PRINCIPAL,
};
pub use store::{
    ActorActivity, LedgerStats, LedgerStore, Order, RecordFilter, RecordRange, Tail,
};
pub use verify::{IntegrityFault, VerificationReport, Verifier, VerifyOptions};
