//! Retention Sweeper
//!
//! Periodically applies each active retention policy to records older than
//! the policy's retention period. Dispositions go through the redaction
//! engine or the archival sink; records are never removed from the chain.
//!
//! Every (policy, record) pair is actioned at most once. Processed markers
//! live in the sweeper's own state, optionally persisted next to the ledger
//! journals, and are written only after a disposition succeeded so failed
//! records are retried on the next cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::{ActorRef, AuditRecord, FieldPath, LedgerStore};
use crate::redaction::RedactionEngine;
use crate::retention::policy::{Disposition, PolicyStore, RetentionPolicy};
use crate::sinks::{retry_with_backoff, ArchiveSink, SinkError};

pub const SWEEP_STATE_FILE: &str = "sweep_state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Archive attempts per record within one cycle
    pub sink_attempts: u32,
    pub backoff_ms: u64,
    /// Diff keys treated as personal data by the `anonymize` disposition
    pub personal_fields: Vec<String>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            sink_attempts: 3,
            backoff_ms: 500,
            personal_fields: ["email", "phone", "first_name", "last_name", "address"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SweepState {
    processed: BTreeSet<String>,
    archived: BTreeMap<String, String>,
}

/// Outcome of one sweep cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub policies: usize,
    /// Records newly actioned in this cycle
    pub actioned: Vec<u64>,
    /// Records that received new tombstones
    pub redacted: Vec<u64>,
    /// Records copied to the archival sink, with their locations
    pub archived: Vec<(u64, String)>,
    /// Records whose disposition failed and will be retried
    pub failed: Vec<(u64, String)>,
    /// Records already actioned by an earlier cycle
    pub already_processed: usize,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        format!(
            "Sweep over {} policies: {} actioned ({} redacted, {} archived), {} failed, {} previously processed",
            self.policies,
            self.actioned.len(),
            self.redacted.len(),
            self.archived.len(),
            self.failed.len(),
            self.already_processed
        )
    }
}

enum Disposed {
    Redacted(bool),
    Archived(String),
}

pub struct RetentionSweeper {
    store: LedgerStore,
    engine: RedactionEngine,
    archive: Option<Arc<dyn ArchiveSink>>,
    policies: Arc<PolicyStore>,
    config: SweeperConfig,
    state: Mutex<SweepState>,
    state_path: Option<PathBuf>,
}

impl RetentionSweeper {
    /// Build a sweeper, resuming processed markers from the ledger's data
    /// directory when the store is durable.
    pub fn new(
        engine: RedactionEngine,
        archive: Option<Arc<dyn ArchiveSink>>,
        policies: Arc<PolicyStore>,
        config: SweeperConfig,
    ) -> Result<Self> {
        let store = engine.store().clone();
        let state_path = store.data_dir().map(|dir| dir.join(SWEEP_STATE_FILE));
        let state = match &state_path {
            Some(path) => load_state(path)?,
            None => SweepState::default(),
        };

        Ok(Self {
            store,
            engine,
            archive,
            policies,
            config,
            state: Mutex::new(state),
            state_path,
        })
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Location the record was archived to, if it was
    pub async fn archived_location(&self, policy: &RetentionPolicy, sequence: u64) -> Option<String> {
        let state = self.state.lock().await;
        state.archived.get(&marker(policy, sequence)).cloned()
    }

    pub async fn run_cycle(&self) -> SweepReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One sweep as of `now`. Per-record failures are collected in the
    /// report; they never stop the remaining records.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> SweepReport {
        let policies = self.policies.current();
        let mut state = self.state.lock().await;
        let mut report = SweepReport {
            policies: policies.len(),
            ..SweepReport::default()
        };

        for policy in policies.active() {
            let cutoff = now - policy.retention();

            for record in self.store.read_range(1, u64::MAX) {
                // Timestamps never decrease along the chain
                if record.timestamp() >= cutoff {
                    break;
                }
                if record.target().entity_type != policy.entity_type {
                    continue;
                }

                let key = marker(policy, record.sequence());
                if state.processed.contains(&key) {
                    report.already_processed += 1;
                    continue;
                }

                match self.dispose(policy, &record).await {
                    Ok(Disposed::Redacted(changed)) => {
                        if changed {
                            report.redacted.push(record.sequence());
                        }
                    }
                    Ok(Disposed::Archived(location)) => {
                        state.archived.insert(key.clone(), location.clone());
                        report.archived.push((record.sequence(), location));
                    }
                    Err(e) => {
                        warn!(
                            "Retention {} of sequence {} failed, will retry next cycle: {}",
                            policy.disposition.as_str(),
                            record.sequence(),
                            e
                        );
                        report.failed.push((record.sequence(), e.to_string()));
                        continue;
                    }
                }

                state.processed.insert(key);
                self.persist(&state);
                report.actioned.push(record.sequence());
            }
        }
        drop(state);

        if !report.redacted.is_empty() {
            if let Err(e) = self.store.compact().await {
                error!("Ledger compaction after sweep failed: {}", e);
            }
        }

        info!("{}", report.summary());
        report
    }

    /// Save markers right after each disposition so a crash mid-cycle
    /// never actions the same record twice
    fn persist(&self, state: &SweepState) {
        if let Some(path) = &self.state_path {
            if let Err(e) = save_state(path, state) {
                error!("Failed to persist sweep state: {}", e);
            }
        }
    }

    async fn dispose(&self, policy: &RetentionPolicy, record: &AuditRecord) -> Result<Disposed> {
        let reason = format!("retention.{}", policy.disposition.as_str());
        let fields = match policy.disposition {
            Disposition::Delete => record.personal_fields(),
            Disposition::Anonymize => self.anonymize_fields(record),
            Disposition::Archive => return self.archive(record).await,
        };

        if fields.is_empty() {
            debug!("Sequence {} holds no personal data to redact", record.sequence());
            return Ok(Disposed::Redacted(false));
        }

        let outcome = self
            .engine
            .redact(record.sequence(), &fields, &reason, &ActorRef::system())
            .await?;
        Ok(Disposed::Redacted(outcome.changed()))
    }

    fn anonymize_fields(&self, record: &AuditRecord) -> Vec<FieldPath> {
        let mut fields = vec![
            FieldPath::Actor,
            FieldPath::NetworkOrigin,
            FieldPath::ClientDescriptor,
        ];
        fields.extend(self.config.personal_fields.iter().map(FieldPath::diff));
        fields.retain(|field| record.has_value(field));
        fields
    }

    async fn archive(&self, record: &AuditRecord) -> Result<Disposed> {
        let sink = self.archive.as_ref().ok_or_else(|| {
            LedgerError::Sink(SinkError::Unavailable(
                "no archival sink configured".to_string(),
            ))
        })?;

        // Current view, including any redactions applied since append
        let view = self
            .store
            .get(record.sequence())
            .ok_or(LedgerError::NotFound {
                sequence: record.sequence(),
            })?
            .view();

        let location = retry_with_backoff(
            self.config.sink_attempts,
            Duration::from_millis(self.config.backoff_ms),
            || sink.archive(&view),
        )
        .await?;

        info!("Archived sequence {} to {}", record.sequence(), location);
        Ok(Disposed::Archived(location))
    }

    /// Sweep on the configured interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        info!(
            "Retention sweeper started (every {}s)",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Retention sweeper stopped");
    }
}

fn marker(policy: &RetentionPolicy, sequence: u64) -> String {
    format!("{}#{}", policy.key(), sequence)
}

fn load_state(path: &Path) -> Result<SweepState> {
    if !path.exists() {
        return Ok(SweepState::default());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_state(path: &Path, state: &SweepState) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(state)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
