#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use compliance_ledger::ingest::IngestionGateway;
use compliance_ledger::ledger::{
    ActionKind, ActorRef, EventCandidate, LedgerStore, OriginMetadata, RecordView, Target,
};
use compliance_ledger::redaction::RedactionEngine;
use compliance_ledger::retention::{
    PolicySet, PolicyStore, RetentionPolicy, RetentionSweeper, SweeperConfig,
};
use compliance_ledger::sinks::{ArchiveSink, ExportSink, MemorySink, SinkError};
use compliance_ledger::subject::{ExportBundle, SubjectRequestConfig, SubjectRequestProcessor};

/// Every ledger component wired to one store
pub struct TestLedger {
    pub store: LedgerStore,
    pub gateway: IngestionGateway,
    pub engine: RedactionEngine,
    pub processor: SubjectRequestProcessor,
    pub sink: Arc<MemorySink>,
    pub policies: Arc<PolicyStore>,
}

impl TestLedger {
    pub fn in_memory() -> Self {
        Self::with_store(LedgerStore::in_memory())
    }

    pub fn open(dir: &Path) -> Self {
        Self::with_store(LedgerStore::open(dir).expect("ledger opens"))
    }

    pub fn with_store(store: LedgerStore) -> Self {
        let gateway = IngestionGateway::new(store.clone());
        let engine = RedactionEngine::new(gateway.clone());
        let sink = Arc::new(MemorySink::new());
        let processor = SubjectRequestProcessor::new(
            engine.clone(),
            gateway.clone(),
            sink.clone(),
            fast_subject_config(),
        )
        .expect("subject requests load");

        Self {
            store,
            gateway,
            engine,
            processor,
            sink,
            policies: Arc::new(PolicyStore::new(PolicySet::default())),
        }
    }

    pub fn set_policies(&self, policies: Vec<RetentionPolicy>) {
        self.policies
            .replace(PolicySet::from_policies(policies).expect("valid policies"));
    }

    pub fn sweeper(&self, archive: Option<Arc<dyn ArchiveSink>>) -> RetentionSweeper {
        RetentionSweeper::new(
            self.engine.clone(),
            archive,
            self.policies.clone(),
            SweeperConfig {
                backoff_ms: 1,
                ..SweeperConfig::default()
            },
        )
        .expect("sweeper state loads")
    }

    /// Append `count` update events, returning their sequences
    pub async fn seed(&self, count: u64) -> Vec<u64> {
        let mut sequences = Vec::new();
        for i in 1..=count {
            let record = self
                .gateway
                .submit(customer_update(&format!("staff-{}", i % 3), &i.to_string()))
                .await
                .expect("append succeeds");
            sequences.push(record.sequence());
        }
        sequences
    }
}

pub fn fast_subject_config() -> SubjectRequestConfig {
    SubjectRequestConfig {
        backoff_ms: 1,
        ..SubjectRequestConfig::default()
    }
}

pub fn customer_update(actor: &str, customer_id: &str) -> EventCandidate {
    EventCandidate::new(
        ActorRef::principal(actor),
        ActionKind::Update,
        Target::new("crm.customer", customer_id),
    )
    .with_change("email", "a@x.com", "b@y.com")
    .with_origin(OriginMetadata::new("192.168.1.20", "Mozilla/5.0"))
}

pub fn pet_event(actor: &str, pet_id: &str) -> EventCandidate {
    EventCandidate::new(
        ActorRef::principal(actor),
        ActionKind::Create,
        Target::new("Pet", pet_id),
    )
    .with_change("name", "", "Rex")
    .with_change("email", "", "owner@example.com")
    .with_origin(OriginMetadata::new("10.2.0.7", "Firefox/128"))
}

pub fn days_from_now(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}

/// Sink that fails a fixed number of times before accepting writes
pub struct FlakySink {
    failures_left: AtomicU32,
    inner: MemorySink,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            inner: MemorySink::new(),
        }
    }

    pub fn archived(&self) -> Vec<RecordView> {
        self.inner.archived()
    }

    fn should_fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ArchiveSink for FlakySink {
    async fn archive(&self, view: &RecordView) -> Result<String, SinkError> {
        if self.should_fail() {
            return Err(SinkError::Unavailable("archive offline".to_string()));
        }
        self.inner.archive(view).await
    }
}

#[async_trait]
impl ExportSink for FlakySink {
    async fn write_export(&self, bundle: &ExportBundle) -> Result<String, SinkError> {
        if self.should_fail() {
            return Err(SinkError::Unavailable("export store offline".to_string()));
        }
        self.inner.write_export(bundle).await
    }
}
