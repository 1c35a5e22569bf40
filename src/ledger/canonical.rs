//! Canonical Encoder
//!
//! Deterministic, type-tagged byte encoding of a record's captured fields.
//! Mapping keys are emitted in sorted order and every value carries a tag
//! byte plus fixed-width lengths, so identical logical input always yields
//! identical bytes.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ledger::record::{
    ActionKind, ActorRef, AuditRecord, DiffPayload, EventCandidate, FieldValue, OriginMetadata,
    Sensitivity, Target,
};

const FORMAT_HEADER: &[u8] = b"CLR1";

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_U64: u8 = 0x05;
const TAG_TIMESTAMP: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_ABSENT: u8 = 0x08;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("non-finite float in field {field}")]
    NonFiniteFloat { field: String },

    #[error("unsupported value in field {field}: {kind}")]
    UnsupportedValue { field: String, kind: String },

    #[error("value too large to encode in field {field}")]
    TooLarge { field: String },
}

/// Fields covered by a record's content hash, as captured at append time
#[derive(Debug, Clone, Copy)]
pub struct CanonicalFields<'a> {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_ref: &'a ActorRef,
    pub action_kind: ActionKind,
    pub target: &'a Target,
    pub diff_payload: &'a DiffPayload,
    pub origin_metadata: &'a OriginMetadata,
    pub sensitivity: Sensitivity,
}

impl<'a> CanonicalFields<'a> {
    pub fn of_candidate(
        sequence: u64,
        timestamp: DateTime<Utc>,
        candidate: &'a EventCandidate,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            actor_ref: &candidate.actor_ref,
            action_kind: candidate.action_kind,
            target: &candidate.target,
            diff_payload: &candidate.diff_payload,
            origin_metadata: &candidate.origin_metadata,
            sensitivity: candidate.sensitivity,
        }
    }

    /// Live fields of a sealed record. Only equal to the captured fields
    /// while the record carries no redaction overlay.
    pub fn of_record(record: &'a AuditRecord) -> Self {
        Self {
            sequence: record.sequence(),
            timestamp: record.timestamp(),
            actor_ref: record.actor_ref(),
            action_kind: record.action_kind(),
            target: record.target(),
            diff_payload: record.diff_payload(),
            origin_metadata: record.origin_metadata(),
            sensitivity: record.sensitivity(),
        }
    }
}

/// Encode record fields into their canonical byte form
pub fn encode(fields: &CanonicalFields<'_>) -> Result<Vec<u8>, EncodingError> {
    let mut enc = Encoder::default();
    enc.buf.extend_from_slice(FORMAT_HEADER);

    enc.label("sequence")?;
    enc.put_u64(fields.sequence);

    enc.label("timestamp")?;
    enc.put_timestamp(fields.timestamp);

    enc.label("actor_ref")?;
    match fields.actor_ref {
        ActorRef::Principal(id) => enc.put_text("actor_ref", id)?,
        ActorRef::Unknown => enc.put_absent(),
    }

    enc.label("action_kind")?;
    enc.put_text("action_kind", fields.action_kind.as_str())?;

    enc.label("target")?;
    enc.put_text("target.entity_type", &fields.target.entity_type)?;
    enc.put_text("target.entity_id", &fields.target.entity_id)?;

    enc.label("diff_payload")?;
    enc.put_len(TAG_MAP, fields.diff_payload.len(), "diff_payload")?;
    // BTreeMap iterates in key order
    for (name, change) in fields.diff_payload {
        enc.put_text("diff_payload", name)?;
        enc.put_value(name, &change.before)?;
        enc.put_value(name, &change.after)?;
    }

    enc.label("origin_metadata")?;
    enc.put_optional_text(
        "origin.network_origin",
        fields.origin_metadata.network_origin.as_deref(),
    )?;
    enc.put_optional_text(
        "origin.client_descriptor",
        fields.origin_metadata.client_descriptor.as_deref(),
    )?;

    enc.label("sensitivity")?;
    enc.put_text("sensitivity", fields.sensitivity.as_str())?;

    Ok(enc.buf)
}

/// Hash of the canonical encoding, in `sha256:<hex>` form
pub fn content_hash(fields: &CanonicalFields<'_>) -> Result<String, EncodingError> {
    Ok(sha256_tagged(&encode(fields)?))
}

/// Link a record's content hash to its predecessor's chain hash
pub fn chain_hash(previous_chain_hash: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((previous_chain_hash.len() as u32).to_be_bytes());
    hasher.update(previous_chain_hash.as_bytes());
    hasher.update((content_hash.len() as u32).to_be_bytes());
    hasher.update(content_hash.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_tagged(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn label(&mut self, name: &str) -> Result<(), EncodingError> {
        self.put_text(name, name)
    }

    fn put_len(&mut self, tag: u8, len: usize, field: &str) -> Result<(), EncodingError> {
        let len = u32::try_from(len).map_err(|_| EncodingError::TooLarge {
            field: field.to_string(),
        })?;
        self.buf.push(tag);
        self.buf.extend_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn put_text(&mut self, field: &str, s: &str) -> Result<(), EncodingError> {
        self.put_len(TAG_TEXT, s.len(), field)?;
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn put_optional_text(&mut self, field: &str, s: Option<&str>) -> Result<(), EncodingError> {
        match s {
            Some(s) => self.put_text(field, s),
            None => {
                self.put_absent();
                Ok(())
            }
        }
    }

    fn put_absent(&mut self) {
        self.buf.push(TAG_ABSENT);
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.push(TAG_U64);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_timestamp(&mut self, ts: DateTime<Utc>) {
        self.buf.push(TAG_TIMESTAMP);
        self.buf.extend_from_slice(&ts.timestamp().to_be_bytes());
        self.buf
            .extend_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
    }

    fn put_value(&mut self, field: &str, value: &FieldValue) -> Result<(), EncodingError> {
        match value {
            FieldValue::Null => self.buf.push(TAG_NULL),
            FieldValue::Bool(b) => {
                self.buf.push(TAG_BOOL);
                self.buf.push(u8::from(*b));
            }
            FieldValue::Int(i) => {
                self.buf.push(TAG_INT);
                self.buf.extend_from_slice(&i.to_be_bytes());
            }
            FieldValue::Float(f) => {
                if !f.is_finite() {
                    return Err(EncodingError::NonFiniteFloat {
                        field: field.to_string(),
                    });
                }
                // -0.0 and 0.0 compare equal, so they must encode equally
                let normalized = if *f == 0.0 { 0.0f64 } else { *f };
                self.buf.push(TAG_FLOAT);
                self.buf.extend_from_slice(&normalized.to_bits().to_be_bytes());
            }
            FieldValue::Text(s) => self.put_text(field, s)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::FieldChange;
    use chrono::TimeZone;

    fn candidate() -> EventCandidate {
        EventCandidate::new(
            ActorRef::principal("staff-1"),
            ActionKind::Update,
            Target::new("Pet", "17"),
        )
        .with_change("name", "Rex", "Rexy")
        .with_change("weight", 12.5, 13.0)
        .with_origin(OriginMetadata::new("192.168.1.4", "Safari"))
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let c = candidate();
        let a = encode(&CanonicalFields::of_candidate(1, ts(), &c)).unwrap();
        let b = encode(&CanonicalFields::of_candidate(1, ts(), &c)).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(FORMAT_HEADER));
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut first = candidate();
        first.diff_payload.clear();
        first
            .diff_payload
            .insert("b".to_string(), FieldChange::new(1i64, 2i64));
        first
            .diff_payload
            .insert("a".to_string(), FieldChange::new("x", "y"));

        let mut second = candidate();
        second.diff_payload.clear();
        second
            .diff_payload
            .insert("a".to_string(), FieldChange::new("x", "y"));
        second
            .diff_payload
            .insert("b".to_string(), FieldChange::new(1i64, 2i64));

        assert_eq!(
            content_hash(&CanonicalFields::of_candidate(3, ts(), &first)).unwrap(),
            content_hash(&CanonicalFields::of_candidate(3, ts(), &second)).unwrap()
        );
    }

    #[test]
    fn test_type_tags_distinguish_values() {
        let text = candidate().with_change("n", FieldValue::Null, "1");
        let int = candidate().with_change("n", FieldValue::Null, 1i64);
        assert_ne!(
            encode(&CanonicalFields::of_candidate(1, ts(), &text)).unwrap(),
            encode(&CanonicalFields::of_candidate(1, ts(), &int)).unwrap()
        );
    }

    #[test]
    fn test_sequence_and_timestamp_are_covered() {
        let c = candidate();
        let base = content_hash(&CanonicalFields::of_candidate(1, ts(), &c)).unwrap();
        let other_seq = content_hash(&CanonicalFields::of_candidate(2, ts(), &c)).unwrap();
        let later = ts() + chrono::Duration::microseconds(1);
        let other_ts = content_hash(&CanonicalFields::of_candidate(1, later, &c)).unwrap();
        assert_ne!(base, other_seq);
        assert_ne!(base, other_ts);
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        let c = candidate().with_change("ratio", FieldValue::Null, f64::NAN);
        let err = encode(&CanonicalFields::of_candidate(1, ts(), &c)).unwrap_err();
        assert_eq!(
            err,
            EncodingError::NonFiniteFloat {
                field: "ratio".to_string()
            }
        );
    }

    #[test]
    fn test_chain_hash_format() {
        let hash = chain_hash(crate::ledger::record::GENESIS_SEED, "sha256:abc");
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), 71);
        assert_ne!(hash, chain_hash("sha256:other", "sha256:abc"));
    }
}
