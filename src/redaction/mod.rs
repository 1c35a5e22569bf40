//! Redaction Engine
//!
//! Applies sanctioned tombstone overlays to personal-data fields of existing
//! records and logs every redaction back into the ledger as a `redact`
//! event. The event names the target sequence and field names, never the
//! former values.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LedgerError, Result};
use crate::ingest::IngestionGateway;
use crate::ledger::{
    ActionKind, ActorRef, AuditRecord, EventCandidate, FieldChange, FieldPath, FieldValue,
    LedgerStore, RedactionOverlay, Target, Tombstone,
};

/// Entity type of the target of `redact` events
pub const REDACTION_TARGET_TYPE: &str = "AuditRecord";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionOutcome {
    pub sequence: u64,
    /// Fields that received a new tombstone in this call
    pub applied: Vec<FieldPath>,
    /// Fields left alone: no recorded value, or already tombstoned
    pub skipped: Vec<FieldPath>,
    /// Sequence of the `redact` event logged for this call
    pub event_sequence: u64,
}

impl RedactionOutcome {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

#[derive(Clone)]
pub struct RedactionEngine {
    gateway: IngestionGateway,
}

impl RedactionEngine {
    pub fn new(gateway: IngestionGateway) -> Self {
        Self { gateway }
    }

    pub fn store(&self) -> &LedgerStore {
        self.gateway.store()
    }

    /// Tombstone `fields` on record `sequence` and log the redaction.
    ///
    /// Fields that hold no value or already carry a tombstone are skipped
    /// without error. Fails with `NotFound` if the record does not exist.
    pub async fn redact(
        &self,
        sequence: u64,
        fields: &[FieldPath],
        reason: &str,
        actor_ref: &ActorRef,
    ) -> Result<RedactionOutcome> {
        if fields.is_empty() {
            return Err(LedgerError::validation("no fields named for redaction"));
        }
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("redaction reason must not be empty"));
        }

        let original = self
            .store()
            .get(sequence)
            .ok_or(LedgerError::NotFound { sequence })?;

        let tombstone = Tombstone::new(reason, actor_ref.clone());
        let overlay: RedactionOverlay = fields
            .iter()
            .map(|field| (field.clone(), tombstone.clone()))
            .collect();

        let applied = match self.store().apply_redaction(sequence, overlay).await {
            Ok(applied) => applied,
            Err(e) if e.is_already_redacted() => Vec::new(),
            Err(e) => return Err(e),
        };
        let skipped: Vec<FieldPath> = fields
            .iter()
            .filter(|field| !applied.contains(field))
            .cloned()
            .collect();

        let event = redaction_event(&original, &applied, &skipped, reason, actor_ref);
        let event_sequence = self.gateway.submit(event).await?.sequence();

        info!(
            "Redacted {} field(s) on sequence {} ({} skipped), logged as {}",
            applied.len(),
            sequence,
            skipped.len(),
            event_sequence
        );

        Ok(RedactionOutcome {
            sequence,
            applied,
            skipped,
            event_sequence,
        })
    }

    /// Tombstone every personal-data field that still holds a value
    pub async fn redact_all(
        &self,
        sequence: u64,
        reason: &str,
        actor_ref: &ActorRef,
    ) -> Result<RedactionOutcome> {
        let record = self
            .store()
            .get(sequence)
            .ok_or(LedgerError::NotFound { sequence })?;

        let mut fields = record.personal_fields();
        if fields.is_empty() {
            fields.push(FieldPath::Actor);
        }
        self.redact(sequence, &fields, reason, actor_ref).await
    }
}

fn redaction_event(
    original: &AuditRecord,
    applied: &[FieldPath],
    skipped: &[FieldPath],
    reason: &str,
    actor_ref: &ActorRef,
) -> EventCandidate {
    let join = |fields: &[FieldPath]| {
        fields
            .iter()
            .map(FieldPath::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };
    let sequence = i64::try_from(original.sequence()).unwrap_or(i64::MAX);

    let mut event = EventCandidate::new(
        actor_ref.clone(),
        ActionKind::Redact,
        Target::new(REDACTION_TARGET_TYPE, original.sequence().to_string()),
    )
    .with_sensitivity(original.sensitivity());

    for (key, value) in [
        ("target_sequence", FieldValue::Int(sequence)),
        (
            "target_entity_type",
            FieldValue::from(original.target().entity_type.clone()),
        ),
        ("redacted_fields", FieldValue::from(join(applied))),
        ("skipped_fields", FieldValue::from(join(skipped))),
        ("reason", FieldValue::from(reason)),
    ] {
        event
            .diff_payload
            .insert(key.to_string(), FieldChange::new(FieldValue::Null, value));
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{OriginMetadata, Verifier, Viewed};

    async fn engine_with_record() -> (RedactionEngine, u64) {
        let gateway = IngestionGateway::new(LedgerStore::in_memory());
        let record = gateway
            .submit(
                EventCandidate::new(
                    ActorRef::principal("staff-1"),
                    ActionKind::Update,
                    Target::new("crm.customer", "42"),
                )
                .with_change("email", "a@x.com", "b@y.com")
                .with_origin(OriginMetadata::new("10.1.1.1", "Safari")),
            )
            .await
            .unwrap();
        (RedactionEngine::new(gateway), record.sequence())
    }

    #[tokio::test]
    async fn test_redact_logs_event_with_next_sequence() {
        let (engine, seq) = engine_with_record().await;
        let dpo = ActorRef::principal("dpo");

        let outcome = engine
            .redact(seq, &[FieldPath::diff("email")], "gdpr.erasure", &dpo)
            .await
            .unwrap();
        assert_eq!(outcome.applied, vec![FieldPath::diff("email")]);
        assert_eq!(outcome.event_sequence, seq + 1);

        let view = engine.store().get(seq).unwrap().view();
        assert!(matches!(view.diff["email"], Viewed::Redacted(ref t) if t.reason == "gdpr.erasure"));

        let event = engine.store().get(outcome.event_sequence).unwrap();
        assert_eq!(event.action_kind(), ActionKind::Redact);
        assert_eq!(event.target(), &Target::new(REDACTION_TARGET_TYPE, "1"));
        assert_eq!(
            event.diff_payload()["redacted_fields"].after,
            FieldValue::from("email")
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("a@x.com"));

        assert!(Verifier::new(engine.store().clone()).verify(0, u64::MAX).is_ok());
    }

    #[tokio::test]
    async fn test_repeated_redaction_is_idempotent() {
        let (engine, seq) = engine_with_record().await;
        let dpo = ActorRef::principal("dpo");
        let fields = [FieldPath::diff("email")];

        engine.redact(seq, &fields, "gdpr", &dpo).await.unwrap();
        let overlay = engine.store().get(seq).unwrap().redaction_overlay().cloned();

        let again = engine.redact(seq, &fields, "gdpr", &dpo).await.unwrap();
        assert!(!again.changed());
        assert_eq!(again.skipped, fields.to_vec());
        assert_eq!(
            engine.store().get(seq).unwrap().redaction_overlay().cloned(),
            overlay
        );

        // A conflicting tombstone is treated as already handled
        let other = engine
            .redact(seq, &fields, "retention.delete", &ActorRef::principal("system"))
            .await
            .unwrap();
        assert!(!other.changed());
    }

    #[tokio::test]
    async fn test_redact_missing_sequence() {
        let (engine, _) = engine_with_record().await;
        let err = engine
            .redact(40, &[FieldPath::Actor], "gdpr", &ActorRef::principal("dpo"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { sequence: 40 }));
        assert_eq!(engine.store().len(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_field_is_noop() {
        let (engine, seq) = engine_with_record().await;
        let outcome = engine
            .redact(seq, &[FieldPath::diff("phone")], "gdpr", &ActorRef::principal("dpo"))
            .await
            .unwrap();
        assert!(outcome.applied.is_empty());
        assert!(!engine.store().get(seq).unwrap().is_redacted());
    }

    #[tokio::test]
    async fn test_redact_all_scrubs_personal_data() {
        let (engine, seq) = engine_with_record().await;
        let outcome = engine
            .redact_all(seq, "gdpr", &ActorRef::principal("dpo"))
            .await
            .unwrap();
        assert_eq!(outcome.applied.len(), 4);

        let record = engine.store().get(seq).unwrap();
        assert!(!record.has_personal_data());
        assert_eq!(record.actor_ref(), &ActorRef::Unknown);
        assert_eq!(record.target(), &Target::new("crm.customer", "42"));
    }
}
