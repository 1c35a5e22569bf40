//! Ingestion Gateway
//!
//! Public write API for domain collaborators. Validates candidate events and
//! hands them to the ledger store; the store's append cursor is the only
//! lock an ingestion call ever waits on.

pub mod views;

use tracing::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::{
    ActionKind, ActorRef, AuditRecord, DiffPayload, EventCandidate, FieldChange, FieldPath,
    FieldValue, LedgerStore, OriginMetadata, Target,
};

pub use views::{target_from_path, ViewLoggingConfig, ViewLoggingMode, ViewPolicy};

/// Client descriptors longer than this are truncated before they are recorded
pub const MAX_CLIENT_DESCRIPTOR_LEN: usize = 500;

#[derive(Clone)]
pub struct IngestionGateway {
    store: LedgerStore,
    views: ViewPolicy,
}

impl IngestionGateway {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            store,
            views: ViewPolicy::default(),
        }
    }

    pub fn with_view_logging(store: LedgerStore, config: &ViewLoggingConfig) -> Result<Self> {
        Ok(Self {
            store,
            views: ViewPolicy::compile(config)?,
        })
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Record one state-changing action, returning its sequence number
    pub async fn record_event(
        &self,
        actor_ref: ActorRef,
        action_kind: ActionKind,
        target: Target,
        diff_payload: DiffPayload,
        origin_metadata: OriginMetadata,
    ) -> Result<u64> {
        let candidate = EventCandidate {
            actor_ref,
            action_kind,
            target,
            diff_payload,
            origin_metadata,
            sensitivity: Default::default(),
        };
        Ok(self.submit(candidate).await?.sequence())
    }

    /// Validate and append a fully built candidate
    pub async fn submit(&self, mut candidate: EventCandidate) -> Result<AuditRecord> {
        validate(&candidate)?;
        truncate_client_descriptor(&mut candidate.origin_metadata);

        let record = self.store.append(candidate).await.map_err(|e| {
            warn!("Rejected ledger event: {}", e);
            e
        })?;
        Ok(record)
    }

    /// Whether a read of `path` would be logged under the current policy
    pub fn should_log_view(&self, path: &str) -> bool {
        self.views.should_log(path)
    }

    /// Log a read request as a `view` event if the view policy selects it.
    ///
    /// Returns `None` when the path is not audited.
    pub async fn record_view(
        &self,
        actor_ref: ActorRef,
        target: Target,
        request_path: &str,
        origin_metadata: OriginMetadata,
    ) -> Result<Option<u64>> {
        if !self.views.should_log(request_path) {
            debug!("View of {} not audited", request_path);
            return Ok(None);
        }

        let mut candidate = EventCandidate::new(actor_ref, ActionKind::View, target)
            .with_origin(origin_metadata)
            .with_sensitivity(self.views.sensitivity(request_path));
        candidate.diff_payload.insert(
            "url_path".to_string(),
            FieldChange::new(FieldValue::Null, request_path),
        );

        Ok(Some(self.submit(candidate).await?.sequence()))
    }
}

fn validate(candidate: &EventCandidate) -> Result<()> {
    if candidate.target.entity_type.trim().is_empty() {
        return Err(LedgerError::validation("target entity_type must not be empty"));
    }
    if candidate.target.entity_id.trim().is_empty() {
        return Err(LedgerError::validation("target entity_id must not be empty"));
    }
    if let ActorRef::Principal(id) = &candidate.actor_ref {
        if id.trim().is_empty() {
            return Err(LedgerError::validation("actor identifier must not be empty"));
        }
    }
    for key in candidate.diff_payload.keys() {
        if key.is_empty() {
            return Err(LedgerError::validation("diff field names must not be empty"));
        }
        if FieldPath::is_reserved_diff_key(key) {
            return Err(LedgerError::validation(format!(
                "diff field name {:?} is reserved",
                key
            )));
        }
    }
    Ok(())
}

fn truncate_client_descriptor(origin: &mut OriginMetadata) {
    if let Some(descriptor) = origin.client_descriptor.as_mut() {
        if let Some((cut, _)) = descriptor.char_indices().nth(MAX_CLIENT_DESCRIPTOR_LEN) {
            descriptor.truncate(cut);
        }
    }
}
