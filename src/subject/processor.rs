//! Subject Request Processor
//!
//! Drives export and delete requests from `pending` to a terminal state.
//! Requests are queued on an mpsc channel and consumed by a small pool of
//! workers; each transition is appended to the ledger by the system
//! principal against the request's own id, never the subject's.
//!
//! A request only covers records that existed when processing began (the
//! processing bound). Records appended afterwards need a follow-up request.
//!
//! Request state is saved next to the ledger journals after every
//! transition. On restart pending requests are queued again and requests
//! that were mid-run resume against their original bound.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ingest::IngestionGateway;
use crate::ledger::{
    ActionKind, ActorRef, AuditRecord, EventCandidate, FieldValue, LedgerStore, Tail, Target,
};
use crate::redaction::RedactionEngine;
use crate::sinks::{retry_with_backoff, ExportSink};
use crate::subject::export::ExportBundle;
use crate::subject::request::{RequestStatus, RequestType, SubjectRequest};

/// Entity type of the target of request lifecycle events
pub const REQUEST_TARGET_TYPE: &str = "SubjectRequest";

/// Tombstone reason for subject erasure
pub const ERASURE_REASON: &str = "subject_request.delete";

pub const SUBJECT_REQUESTS_FILE: &str = "subject_requests.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectRequestConfig {
    pub workers: usize,
    pub export_attempts: u32,
    pub backoff_ms: u64,
    /// Entity types whose entity id identifies a data subject
    pub subject_entity_types: Vec<String>,
}

impl Default for SubjectRequestConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            export_attempts: 3,
            backoff_ms: 500,
            subject_entity_types: vec!["crm.customer".to_string()],
        }
    }
}

struct Inner {
    store: LedgerStore,
    gateway: IngestionGateway,
    engine: RedactionEngine,
    export_sink: Arc<dyn ExportSink>,
    config: SubjectRequestConfig,
    requests: RwLock<HashMap<Uuid, SubjectRequest>>,
    /// Requests found `processing` at load time; they resume without a new start
    interrupted: Mutex<HashSet<Uuid>>,
    state_path: Option<PathBuf>,
    queue: mpsc::UnboundedSender<Uuid>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
}

#[derive(Clone)]
pub struct SubjectRequestProcessor {
    inner: Arc<Inner>,
}

impl SubjectRequestProcessor {
    /// Build a processor, reloading saved requests from the ledger's data
    /// directory when the store is durable. Unfinished requests are queued
    /// for the workers.
    pub fn new(
        engine: RedactionEngine,
        gateway: IngestionGateway,
        export_sink: Arc<dyn ExportSink>,
        config: SubjectRequestConfig,
    ) -> Result<Self> {
        let store = engine.store().clone();
        let state_path = store.data_dir().map(|dir| dir.join(SUBJECT_REQUESTS_FILE));
        let saved = match &state_path {
            Some(path) => load_requests(path)?,
            None => Vec::new(),
        };

        let (queue, receiver) = mpsc::unbounded_channel();
        let mut unfinished: Vec<&SubjectRequest> =
            saved.iter().filter(|r| !r.is_terminal()).collect();
        unfinished.sort_by_key(|r| r.requested_at);
        let interrupted: HashSet<Uuid> = unfinished
            .iter()
            .filter(|r| r.status == RequestStatus::Processing)
            .map(|r| r.id)
            .collect();
        for request in &unfinished {
            // The receiver is alive, so this cannot fail
            let _ = queue.send(request.id);
        }
        if !saved.is_empty() {
            info!(
                "Loaded {} subject requests ({} requeued, {} interrupted)",
                saved.len(),
                unfinished.len(),
                interrupted.len()
            );
        }

        let requests = saved.into_iter().map(|r| (r.id, r)).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                engine,
                export_sink,
                config,
                requests: RwLock::new(requests),
                interrupted: Mutex::new(interrupted),
                state_path,
                queue,
                receiver: Arc::new(Mutex::new(receiver)),
            }),
        })
    }

    fn persist(&self, requests: &HashMap<Uuid, SubjectRequest>) {
        if let Some(path) = &self.inner.state_path {
            if let Err(e) = save_requests(path, requests) {
                error!("Failed to persist subject requests: {}", e);
            }
        }
    }

    /// Accept a request and queue it for the workers
    pub async fn submit(
        &self,
        subject: impl Into<String>,
        request_type: RequestType,
    ) -> Result<SubjectRequest> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(LedgerError::validation("subject must not be empty"));
        }

        let request = SubjectRequest::new(subject, request_type);
        self.log_transition(&request, None).await?;

        {
            let mut requests = self.inner.requests.write().await;
            requests.insert(request.id, request.clone());
            self.persist(&requests);
        }

        if self.inner.queue.send(request.id).is_err() {
            warn!("Subject request queue closed; {} stays pending", request.id);
        }
        info!(
            "Accepted {} request {}",
            request_type.as_str(),
            request.id
        );
        Ok(request)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<SubjectRequest> {
        self.inner
            .requests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::RequestNotFound(id))
    }

    pub async fn list(&self) -> Vec<SubjectRequest> {
        let mut requests: Vec<SubjectRequest> =
            self.inner.requests.read().await.values().cloned().collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Operator cancellation: the request becomes `failed`. Redactions
    /// already applied stay in place.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<SubjectRequest> {
        let (request, previous) = {
            let mut requests = self.inner.requests.write().await;
            let request = requests
                .get_mut(&id)
                .ok_or(LedgerError::RequestNotFound(id))?;
            let previous = request.fail(format!("cancelled: {}", reason))?;
            let request = request.clone();
            self.persist(&requests);
            (request, previous)
        };

        warn!("Subject request {} cancelled: {}", id, reason);
        self.log_transition(&request, Some(previous)).await?;
        Ok(request)
    }

    /// Run a pending request to completion, or resume one that was
    /// interrupted by a restart
    pub async fn process(&self, id: Uuid) -> Result<SubjectRequest> {
        let tail = self.inner.store.tail().sequence;
        let (request, resumed) = {
            let mut requests = self.inner.requests.write().await;
            let request = requests
                .get_mut(&id)
                .ok_or(LedgerError::RequestNotFound(id))?;
            let resumed = request.status == RequestStatus::Processing
                && self.inner.interrupted.lock().await.remove(&id);
            if !resumed {
                request.start(tail)?;
            }
            let request = request.clone();
            self.persist(&requests);
            (request, resumed)
        };
        let bound = request.processing_bound.unwrap_or(tail);

        if resumed {
            info!(
                "Resuming interrupted {} request {} up to sequence {}",
                request.request_type.as_str(),
                id,
                bound
            );
        } else {
            info!(
                "Processing {} request {} up to sequence {}",
                request.request_type.as_str(),
                id,
                bound
            );
            if let Err(e) = self.log_transition(&request, Some(RequestStatus::Pending)).await {
                error!("Subject request {} could not record its start: {}", id, e);
                let mut requests = self.inner.requests.write().await;
                if let Some(current) = requests.get_mut(&id) {
                    if current.status == RequestStatus::Processing {
                        current.fail(format!("lifecycle event not recorded: {}", e))?;
                    }
                }
                self.persist(&requests);
                return Err(e);
            }
        }

        let outcome = match request.request_type {
            RequestType::Export => self.run_export(&request, bound).await.map(Outcome::Exported),
            RequestType::Delete => self.run_delete(&request, bound).await.map(Outcome::Erased),
        };

        let finished = {
            let mut requests = self.inner.requests.write().await;
            let current = requests
                .get_mut(&id)
                .ok_or(LedgerError::RequestNotFound(id))?;

            if current.status != RequestStatus::Processing {
                // Cancelled while running
                info!("Subject request {} finished after cancellation", id);
                return Ok(current.clone());
            }

            match outcome {
                Ok(Outcome::Exported(location)) => current.complete_export(location)?,
                Ok(Outcome::Erased(count)) => current.complete_delete(count)?,
                Err(e) => {
                    error!("Subject request {} failed: {}", id, e);
                    current.fail(e.to_string())?;
                }
            }
            let finished = current.clone();
            self.persist(&requests);
            finished
        };

        self.log_transition(&finished, Some(RequestStatus::Processing))
            .await?;
        info!("Subject request {} {}", id, finished.status);
        Ok(finished)
    }

    /// The subject acted (live actor, or the pseudonym left when the actor
    /// was redacted) or is the target entity
    fn matches_subject(&self, record: &AuditRecord, subject: &str, link: &str) -> bool {
        if record.actor_ref().is(subject) || record.actor_link() == Some(link) {
            return true;
        }
        let target = record.target();
        target.entity_id == subject
            && self
                .inner
                .config
                .subject_entity_types
                .iter()
                .any(|t| *t == target.entity_type)
    }

    fn matching_records(&self, subject: &str, bound: u64) -> Vec<AuditRecord> {
        let link = self.inner.store.actor_link(subject);
        self.inner
            .store
            .read_range(1, bound)
            .filter(|record| self.matches_subject(record, subject, &link))
            .collect()
    }

    async fn run_export(&self, request: &SubjectRequest, bound: u64) -> Result<String> {
        let views = self
            .matching_records(&request.subject, bound)
            .iter()
            .map(AuditRecord::view)
            .collect();
        let tail = self
            .inner
            .store
            .get(bound)
            .map(|r| Tail {
                sequence: r.sequence(),
                chain_hash: r.chain_hash().to_string(),
            })
            .unwrap_or_else(|| self.inner.store.tail());

        let bundle = ExportBundle::build(request.id, &request.subject, tail, views)?;
        debug!("Export {} holds {} records", request.id, bundle.len());

        let sink = &self.inner.export_sink;
        let location = retry_with_backoff(
            self.inner.config.export_attempts,
            Duration::from_millis(self.inner.config.backoff_ms),
            || sink.write_export(&bundle),
        )
        .await?;
        Ok(location)
    }

    async fn run_delete(&self, request: &SubjectRequest, bound: u64) -> Result<u64> {
        let actor = ActorRef::system();
        let matching: Vec<u64> = self
            .matching_records(&request.subject, bound)
            .iter()
            .map(AuditRecord::sequence)
            .collect();

        let mut redacted = 0u64;
        for &sequence in &matching {
            if self.is_cancelled(request.id).await {
                return Err(LedgerError::validation("request cancelled"));
            }
            let Some(record) = self.inner.store.get(sequence) else {
                continue;
            };
            let fields = record.personal_fields();
            if fields.is_empty() {
                continue;
            }
            let outcome = self
                .inner
                .engine
                .redact(sequence, &fields, ERASURE_REASON, &actor)
                .await?;
            if outcome.changed() {
                redacted += 1;
            }
        }

        // Every record captured at the start must now be free of personal data
        let remaining: Vec<u64> = matching
            .iter()
            .copied()
            .filter(|&sequence| {
                self.inner
                    .store
                    .get(sequence)
                    .map_or(false, |record| record.has_personal_data())
            })
            .collect();
        if !remaining.is_empty() {
            return Err(LedgerError::validation(format!(
                "personal data remains on sequences {:?}",
                remaining
            )));
        }

        if redacted > 0 {
            self.inner.store.compact().await?;
        }
        Ok(redacted)
    }

    async fn is_cancelled(&self, id: Uuid) -> bool {
        self.inner
            .requests
            .read()
            .await
            .get(&id)
            .map_or(true, |r| r.status != RequestStatus::Processing)
    }

    async fn log_transition(
        &self,
        request: &SubjectRequest,
        previous: Option<RequestStatus>,
    ) -> Result<u64> {
        let action = if previous.is_none() {
            ActionKind::Create
        } else {
            ActionKind::Update
        };
        let before = previous
            .map(|s| FieldValue::from(s.as_str()))
            .unwrap_or(FieldValue::Null);

        let mut event = EventCandidate::new(
            ActorRef::system(),
            action,
            Target::new(REQUEST_TARGET_TYPE, request.id.to_string()),
        )
        .with_change("status", before, request.status.as_str())
        .with_change("request_type", FieldValue::Null, request.request_type.as_str());

        if let Some(count) = request.redaction_count {
            let count = i64::try_from(count).unwrap_or(i64::MAX);
            event = event.with_change("redaction_count", FieldValue::Null, count);
        }

        Ok(self.inner.gateway.submit(event).await?.sequence())
    }

    /// Spawn the configured number of queue workers
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let count = self.inner.config.workers.max(1);
        info!("Starting {} subject request workers", count);

        (0..count)
            .map(|worker| {
                let processor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { processor.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.inner.receiver.clone();
        loop {
            let next = tokio::select! {
                id = async { receiver.lock().await.recv().await } => id,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Some(id) = next else {
                break;
            };
            if let Err(e) = self.process(id).await {
                // Cancelled before pickup, or already handled
                warn!("Worker {} skipped request {}: {}", worker, id, e);
            }
        }
        debug!("Subject request worker {} stopped", worker);
    }
}

enum Outcome {
    Exported(String),
    Erased(u64),
}

fn load_requests(path: &Path) -> Result<Vec<SubjectRequest>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_requests(path: &Path, requests: &HashMap<Uuid, SubjectRequest>) -> Result<()> {
    let mut saved: Vec<&SubjectRequest> = requests.values().collect();
    saved.sort_by_key(|r| r.requested_at);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(&saved)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FieldPath, OriginMetadata, Verifier};
    use crate::sinks::{MemorySink, SinkError};

    async fn seeded() -> (SubjectRequestProcessor, Arc<MemorySink>, LedgerStore) {
        let store = LedgerStore::in_memory();
        let gateway = IngestionGateway::new(store.clone());

        let events = [
            ("cust-9", "crm.customer", "cust-9"),
            ("staff-1", "crm.customer", "cust-9"),
            ("cust-9", "Appointment", "31"),
            ("staff-1", "Pet", "5"),
        ];
        for (actor, entity_type, entity_id) in events {
            gateway
                .submit(
                    EventCandidate::new(
                        ActorRef::principal(actor),
                        ActionKind::Update,
                        Target::new(entity_type, entity_id),
                    )
                    .with_change("email", "old@x.com", "new@x.com")
                    .with_origin(OriginMetadata::new("10.0.0.3", "Edge")),
                )
                .await
                .unwrap();
        }

        let sink = Arc::new(MemorySink::new());
        let processor = SubjectRequestProcessor::new(
            RedactionEngine::new(gateway.clone()),
            gateway,
            sink.clone(),
            SubjectRequestConfig {
                backoff_ms: 1,
                ..SubjectRequestConfig::default()
            },
        )
        .unwrap();
        (processor, sink, store)
    }

    #[tokio::test]
    async fn test_export_collects_matching_views() {
        let (processor, sink, _store) = seeded().await;

        let request = processor.submit("cust-9", RequestType::Export).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        let done = processor.process(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(
            done.result_location,
            Some(format!("memory://export/{}", request.id))
        );

        let bundles = sink.exports();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].len(), 3);
        assert!(bundles[0].merkle_root.is_some());
    }

    #[tokio::test]
    async fn test_delete_scrubs_every_matching_record() {
        let (processor, _sink, store) = seeded().await;

        let request = processor.submit("cust-9", RequestType::Delete).await.unwrap();
        let done = processor.process(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.redaction_count, Some(3));

        for sequence in 1..=3 {
            assert!(!store.get(sequence).unwrap().has_personal_data());
        }
        assert!(store.get(4).unwrap().has_value(&FieldPath::diff("email")));
        assert!(Verifier::new(store.clone()).verify(0, u64::MAX).is_ok());

        // The subject's identity never reaches the ledger through the request trail
        for record in store.read_range(5, u64::MAX) {
            let json = serde_json::to_string(&record).unwrap();
            assert!(!json.contains("cust-9"), "leaked in {}", record.summary());
        }
    }

    #[tokio::test]
    async fn test_terminal_request_is_not_reprocessed() {
        let (processor, _sink, _store) = seeded().await;
        let request = processor.submit("cust-9", RequestType::Delete).await.unwrap();
        processor.process(request.id).await.unwrap();

        assert!(matches!(
            processor.process(request.id).await,
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_request() {
        let (processor, _sink, _store) = seeded().await;
        let request = processor.submit("cust-9", RequestType::Delete).await.unwrap();

        let cancelled = processor.cancel(request.id, "duplicate").await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Failed);
        assert!(processor.process(request.id).await.is_err());
        assert!(processor.cancel(request.id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_unrecorded_start_fails_request() {
        let (processor, _sink, store) = seeded().await;
        let request = processor.submit("cust-9", RequestType::Delete).await.unwrap();

        store.reject_appends(true);
        assert!(processor.process(request.id).await.is_err());
        store.reject_appends(false);

        let request = processor.get_status(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert!(request
            .failure_reason
            .unwrap()
            .contains("lifecycle event not recorded"));
        assert_eq!(store.stats().redacted_records, 0);
    }

    struct BrokenExport;

    #[async_trait::async_trait]
    impl ExportSink for BrokenExport {
        async fn write_export(&self, _bundle: &ExportBundle) -> std::result::Result<String, SinkError> {
            Err(SinkError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_export_failure_marks_request_failed() {
        let store = LedgerStore::in_memory();
        let gateway = IngestionGateway::new(store.clone());
        let processor = SubjectRequestProcessor::new(
            RedactionEngine::new(gateway.clone()),
            gateway,
            Arc::new(BrokenExport),
            SubjectRequestConfig {
                export_attempts: 2,
                backoff_ms: 1,
                ..SubjectRequestConfig::default()
            },
        )
        .unwrap();

        let request = processor.submit("cust-1", RequestType::Export).await.unwrap();
        let done = processor.process(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Failed);
        assert!(done.failure_reason.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let (processor, _sink, _store) = seeded().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = processor.spawn_workers(shutdown_rx);

        let request = processor.submit("cust-9", RequestType::Export).await.unwrap();
        let mut status = RequestStatus::Pending;
        for _ in 0..200 {
            status = processor.get_status(request.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, RequestStatus::Completed);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
