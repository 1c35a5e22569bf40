//! Audit Record
//!
//! Defines the ledger's record types: the candidate event handed to the
//! store, the sealed record it produces, the redaction overlay that is the
//! only mutable part of a sealed record, and the redaction-applied view
//! handed to readers, sinks and exports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::ledger::canonical::EncodingError;

/// Chain seed used as the "previous chain hash" of sequence 1
pub const GENESIS_SEED: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Principal recorded for actions the ledger takes on its own behalf
pub const SYSTEM_PRINCIPAL: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    View,
    Redact,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Create,
        ActionKind::Update,
        ActionKind::Delete,
        ActionKind::View,
        ActionKind::Redact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::View => "view",
            ActionKind::Redact => "redact",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LedgerError::validation(format!("Unknown action kind: {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Normal,
    High,
    Critical,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Normal => "normal",
            Sensitivity::High => "high",
            Sensitivity::Critical => "critical",
        }
    }
}

impl FromStr for Sensitivity {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Sensitivity::Normal),
            "high" => Ok(Sensitivity::High),
            "critical" => Ok(Sensitivity::Critical),
            other => Err(LedgerError::validation(format!(
                "Unknown sensitivity: {:?}",
                other
            ))),
        }
    }
}

/// Weak reference to the acting principal.
///
/// The ledger never resolves or owns the principal; once the principal's
/// identity is redacted the reference becomes `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRef {
    Principal(String),
    Unknown,
}

impl ActorRef {
    pub fn principal(id: impl Into<String>) -> Self {
        ActorRef::Principal(id.into())
    }

    pub fn system() -> Self {
        ActorRef::Principal(SYSTEM_PRINCIPAL.to_string())
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ActorRef::Principal(id) => Some(id),
            ActorRef::Unknown => None,
        }
    }

    pub fn is(&self, id: &str) -> bool {
        self.id() == Some(id)
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRef::Principal(id) => f.write_str(id),
            ActorRef::Unknown => f.write_str("unknown"),
        }
    }
}

/// Affected domain object. The ledger does not check that it exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub entity_type: String,
    pub entity_id: String,
}

impl Target {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

/// Primitive value kinds allowed in a diff payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
        }
    }

    /// Convert a free-form JSON value, rejecting anything that is not a
    /// primitive the canonical encoder can represent.
    pub fn from_json(field: &str, value: serde_json::Value) -> Result<Self, EncodingError> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(FieldValue::Null),
            Value::Bool(b) => Ok(FieldValue::Bool(b)),
            Value::String(s) => Ok(FieldValue::Text(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FieldValue::Float(f))
                } else {
                    Err(EncodingError::UnsupportedValue {
                        field: field.to_string(),
                        kind: "number out of range".to_string(),
                    })
                }
            }
            Value::Array(_) => Err(EncodingError::UnsupportedValue {
                field: field.to_string(),
                kind: "array".to_string(),
            }),
            Value::Object(_) => Err(EncodingError::UnsupportedValue {
                field: field.to_string(),
                kind: "object".to_string(),
            }),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: FieldValue,
    pub after: FieldValue,
}

impl FieldChange {
    pub fn new(before: impl Into<FieldValue>, after: impl Into<FieldValue>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
        }
    }

    pub fn scrubbed() -> Self {
        Self {
            before: FieldValue::Null,
            after: FieldValue::Null,
        }
    }

    pub fn is_recorded(&self) -> bool {
        self.before != FieldValue::Null || self.after != FieldValue::Null
    }
}

pub type DiffPayload = BTreeMap<String, FieldChange>;

/// Network origin and client descriptor of the request that caused the event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    #[serde(default)]
    pub network_origin: Option<String>,
    #[serde(default)]
    pub client_descriptor: Option<String>,
}

impl OriginMetadata {
    pub fn new(network_origin: impl Into<String>, client_descriptor: impl Into<String>) -> Self {
        Self {
            network_origin: Some(network_origin.into()),
            client_descriptor: Some(client_descriptor.into()),
        }
    }
}

/// Address of a redactable (personal-data) field of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FieldPath {
    Actor,
    NetworkOrigin,
    ClientDescriptor,
    Diff(String),
}

impl FieldPath {
    pub const ACTOR: &'static str = "actor";
    pub const ORIGIN_PREFIX: &'static str = "origin.";

    pub fn diff(name: impl Into<String>) -> Self {
        FieldPath::Diff(name.into())
    }

    /// Whether a diff key would collide with a reserved field path
    pub fn is_reserved_diff_key(key: &str) -> bool {
        key == Self::ACTOR || key.starts_with(Self::ORIGIN_PREFIX)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Actor => f.write_str(Self::ACTOR),
            FieldPath::NetworkOrigin => f.write_str("origin.network_origin"),
            FieldPath::ClientDescriptor => f.write_str("origin.client_descriptor"),
            FieldPath::Diff(name) => f.write_str(name),
        }
    }
}

impl FromStr for FieldPath {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(LedgerError::validation("Empty field name")),
            Self::ACTOR => Ok(FieldPath::Actor),
            "origin.network_origin" => Ok(FieldPath::NetworkOrigin),
            "origin.client_descriptor" => Ok(FieldPath::ClientDescriptor),
            other if other.starts_with(Self::ORIGIN_PREFIX) => Err(LedgerError::validation(
                format!("Unknown origin field: {}", other),
            )),
            other => Ok(FieldPath::Diff(other.to_string())),
        }
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl TryFrom<String> for FieldPath {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Marker left in place of redacted personal data.
///
/// Records only that a redaction happened, why, by whom and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub reason: String,
    pub redacted_by: ActorRef,
    pub redacted_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(reason: impl Into<String>, redacted_by: ActorRef) -> Self {
        Self {
            reason: reason.into(),
            redacted_by,
            redacted_at: Utc::now(),
        }
    }

    /// Same reason and actor; the instant is not part of a tombstone's identity
    pub fn same_redaction(&self, other: &Tombstone) -> bool {
        self.reason == other.reason && self.redacted_by == other.redacted_by
    }
}

pub type RedactionOverlay = BTreeMap<FieldPath, Tombstone>;

/// Event as submitted for append, before the store seals it
#[derive(Debug, Clone, PartialEq)]
pub struct EventCandidate {
    pub actor_ref: ActorRef,
    pub action_kind: ActionKind,
    pub target: Target,
    pub diff_payload: DiffPayload,
    pub origin_metadata: OriginMetadata,
    pub sensitivity: Sensitivity,
}

impl EventCandidate {
    pub fn new(actor_ref: ActorRef, action_kind: ActionKind, target: Target) -> Self {
        Self {
            actor_ref,
            action_kind,
            target,
            diff_payload: DiffPayload::new(),
            origin_metadata: OriginMetadata::default(),
            sensitivity: Sensitivity::Normal,
        }
    }

    pub fn with_change(
        mut self,
        field: impl Into<String>,
        before: impl Into<FieldValue>,
        after: impl Into<FieldValue>,
    ) -> Self {
        self.diff_payload
            .insert(field.into(), FieldChange::new(before, after));
        self
    }

    pub fn with_origin(mut self, origin: OriginMetadata) -> Self {
        self.origin_metadata = origin;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }
}

/// Sealed ledger record.
///
/// Fields are private: after sealing, the only mutation any code path can
/// perform is [`AuditRecord::apply_tombstone`], which scrubs a personal-data
/// value and records the tombstone in the overlay. `sequence`,
/// `content_hash` and `chain_hash` have no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    sequence: u64,
    timestamp: DateTime<Utc>,
    actor_ref: ActorRef,
    action_kind: ActionKind,
    target: Target,
    diff_payload: DiffPayload,
    origin_metadata: OriginMetadata,
    #[serde(default)]
    sensitivity: Sensitivity,
    content_hash: String,
    chain_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redaction_overlay: Option<RedactionOverlay>,
    /// Keyed pseudonym of the actor, stamped when the actor is redacted.
    /// Not part of the content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor_link: Option<String>,
}

impl AuditRecord {
    pub(crate) fn seal(
        sequence: u64,
        timestamp: DateTime<Utc>,
        candidate: EventCandidate,
        content_hash: String,
        chain_hash: String,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            actor_ref: candidate.actor_ref,
            action_kind: candidate.action_kind,
            target: candidate.target,
            diff_payload: candidate.diff_payload,
            origin_metadata: candidate.origin_metadata,
            sensitivity: candidate.sensitivity,
            content_hash,
            chain_hash,
            redaction_overlay: None,
            actor_link: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor_ref
    }

    pub fn action_kind(&self) -> ActionKind {
        self.action_kind
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn diff_payload(&self) -> &DiffPayload {
        &self.diff_payload
    }

    pub fn origin_metadata(&self) -> &OriginMetadata {
        &self.origin_metadata
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn chain_hash(&self) -> &str {
        &self.chain_hash
    }

    pub fn redaction_overlay(&self) -> Option<&RedactionOverlay> {
        self.redaction_overlay.as_ref()
    }

    pub fn is_redacted(&self) -> bool {
        self.redaction_overlay
            .as_ref()
            .map_or(false, |overlay| !overlay.is_empty())
    }

    pub fn actor_link(&self) -> Option<&str> {
        self.actor_link.as_deref()
    }

    pub fn tombstone(&self, field: &FieldPath) -> Option<&Tombstone> {
        self.redaction_overlay.as_ref()?.get(field)
    }

    /// Whether the field currently holds a recorded, unredacted value
    pub fn has_value(&self, field: &FieldPath) -> bool {
        if self.tombstone(field).is_some() {
            return false;
        }
        match field {
            FieldPath::Actor => matches!(self.actor_ref, ActorRef::Principal(_)),
            FieldPath::NetworkOrigin => self.origin_metadata.network_origin.is_some(),
            FieldPath::ClientDescriptor => self.origin_metadata.client_descriptor.is_some(),
            FieldPath::Diff(name) => self
                .diff_payload
                .get(name)
                .map_or(false, FieldChange::is_recorded),
        }
    }

    /// Every personal-data field that still holds a value
    pub fn personal_fields(&self) -> Vec<FieldPath> {
        let mut fields = vec![
            FieldPath::Actor,
            FieldPath::NetworkOrigin,
            FieldPath::ClientDescriptor,
        ];
        fields.extend(self.diff_payload.keys().cloned().map(FieldPath::Diff));
        fields.retain(|field| self.has_value(field));
        fields
    }

    pub fn has_personal_data(&self) -> bool {
        !self.personal_fields().is_empty()
    }

    /// Scrub the field's value and record its tombstone.
    ///
    /// Returns false without touching anything when the field has no value.
    pub(crate) fn apply_tombstone(&mut self, field: &FieldPath, tombstone: Tombstone) -> bool {
        if !self.has_value(field) {
            return false;
        }
        match field {
            FieldPath::Actor => self.actor_ref = ActorRef::Unknown,
            FieldPath::NetworkOrigin => self.origin_metadata.network_origin = None,
            FieldPath::ClientDescriptor => self.origin_metadata.client_descriptor = None,
            FieldPath::Diff(name) => {
                if let Some(change) = self.diff_payload.get_mut(name) {
                    *change = FieldChange::scrubbed();
                }
            }
        }
        self.redaction_overlay
            .get_or_insert_with(RedactionOverlay::new)
            .insert(field.clone(), tombstone);
        true
    }

    /// Keep a pseudonym of the live actor once it is scrubbed
    pub(crate) fn link_actor(&mut self, link: String) {
        if self.actor_link.is_none() {
            self.actor_link = Some(link);
        }
    }

    /// Redaction-applied view of the record
    pub fn view(&self) -> RecordView {
        let actor = match self.tombstone(&FieldPath::Actor) {
            Some(tombstone) => Viewed::Redacted(tombstone.clone()),
            None => Viewed::Value(self.actor_ref.to_string()),
        };

        let diff = self
            .diff_payload
            .iter()
            .map(|(name, change)| {
                let viewed = match self.tombstone(&FieldPath::Diff(name.clone())) {
                    Some(tombstone) => Viewed::Redacted(tombstone.clone()),
                    None => Viewed::Value(change.clone()),
                };
                (name.clone(), viewed)
            })
            .collect();

        let mut origin = BTreeMap::new();
        for (path, value) in [
            (FieldPath::NetworkOrigin, &self.origin_metadata.network_origin),
            (FieldPath::ClientDescriptor, &self.origin_metadata.client_descriptor),
        ] {
            if let Some(tombstone) = self.tombstone(&path) {
                origin.insert(path.to_string(), Viewed::Redacted(tombstone.clone()));
            } else if let Some(value) = value {
                origin.insert(path.to_string(), Viewed::Value(value.clone()));
            }
        }

        RecordView {
            sequence: self.sequence,
            timestamp: self.timestamp,
            action_kind: self.action_kind,
            target: self.target.clone(),
            sensitivity: self.sensitivity,
            actor,
            diff,
            origin,
            content_hash: self.content_hash.clone(),
            chain_hash: self.chain_hash.clone(),
            redacted: self.is_redacted(),
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} {} by {}",
            self.sequence, self.action_kind, self.target, self.actor_ref
        )
    }

    #[cfg(test)]
    pub(crate) fn corrupt_chain_hash(&mut self, chain_hash: &str) {
        self.chain_hash = chain_hash.to_string();
    }

    #[cfg(test)]
    pub(crate) fn corrupt_content_hash(&mut self, content_hash: &str) {
        self.content_hash = content_hash.to_string();
    }
}

/// A field as seen through the redaction overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Viewed<T> {
    Value(T),
    Redacted(Tombstone),
}

impl<T> Viewed<T> {
    pub fn is_redacted(&self) -> bool {
        matches!(self, Viewed::Redacted(_))
    }
}

/// Redaction-applied rendering of a record: original content is never
/// present for fields that carry a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub action_kind: ActionKind,
    pub target: Target,
    pub sensitivity: Sensitivity,
    pub actor: Viewed<String>,
    pub diff: BTreeMap<String, Viewed<FieldChange>>,
    pub origin: BTreeMap<String, Viewed<String>>,
    pub content_hash: String,
    pub chain_hash: String,
    pub redacted: bool,
}
