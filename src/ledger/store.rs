//! Ledger Store
//!
//! Owns the append-only record sequence, the append cursor (next sequence
//! number and chain tail), and the per-record redaction overlays.
//!
//! The append cursor sits behind a single `tokio::sync::Mutex`; it is the
//! only exclusive section on the write path. Readers take a snapshot of the
//! published length and never wait on that mutex. Redaction serializes per
//! record and through the overlay journal, never through the cursor.
//! Compaction writes its replacement journal outside both locks and takes
//! them only to copy the records appended meanwhile and swap files.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::{self, CanonicalFields};
use crate::ledger::journal::{self, Journal, Rewrite};
use crate::ledger::link::SubjectLinker;
use crate::ledger::record::{
    ActionKind, AuditRecord, EventCandidate, FieldPath, RedactionOverlay, Sensitivity, Tombstone,
    GENESIS_SEED,
};

pub const RECORDS_FILE: &str = "records.jsonl";
pub const OVERLAYS_FILE: &str = "overlays.jsonl";

/// Current head of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tail {
    pub sequence: u64,
    pub chain_hash: String,
}

impl Tail {
    fn genesis() -> Self {
        Self {
            sequence: 0,
            chain_hash: GENESIS_SEED.to_string(),
        }
    }
}

/// Record counts for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_records: u64,
    pub redacted_records: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_sensitivity: BTreeMap<String, u64>,
    /// Records per live principal; redacted actors are not counted
    pub by_actor: BTreeMap<String, u64>,
    pub tail: u64,
}

/// What one principal has done, as recorded under their live id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorActivity {
    pub actor: String,
    pub total_actions: u64,
    pub by_action: BTreeMap<String, u64>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Record listing filters; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordFilter {
    pub actor: Option<String>,
    pub action_kind: Option<ActionKind>,
    pub entity_type: Option<String>,
    pub sensitivity: Option<Sensitivity>,
}

impl RecordFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.actor
            .as_deref()
            .map_or(true, |actor| record.actor_ref().is(actor))
            && self
                .action_kind
                .map_or(true, |kind| record.action_kind() == kind)
            && self
                .entity_type
                .as_deref()
                .map_or(true, |entity_type| record.target().entity_type == entity_type)
            && self
                .sensitivity
                .map_or(true, |sensitivity| record.sensitivity() == sensitivity)
    }
}

/// Ordering for [`LedgerStore::query`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Oldest,
    Newest,
}

#[derive(Debug, Serialize, Deserialize)]
struct OverlayEntry {
    sequence: u64,
    overlay: RedactionOverlay,
}

struct Slot {
    sequence: u64,
    record: RwLock<AuditRecord>,
    redaction_lock: Mutex<()>,
}

impl Slot {
    fn new(record: AuditRecord) -> Self {
        Self {
            sequence: record.sequence(),
            record: RwLock::new(record),
            redaction_lock: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AuditRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AuditRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> AuditRecord {
        self.read().clone()
    }
}

struct AppendCursor {
    next_sequence: u64,
    tail_hash: String,
    last_timestamp: Option<DateTime<Utc>>,
    journal: Option<Journal>,
}

struct Inner {
    slots: RwLock<Vec<Arc<Slot>>>,
    published: AtomicUsize,
    cursor: Mutex<AppendCursor>,
    overlay_journal: Mutex<Option<Journal>>,
    compaction: Mutex<()>,
    linker: SubjectLinker,
    data_dir: Option<PathBuf>,
    #[cfg(test)]
    reject_appends: std::sync::atomic::AtomicBool,
}

/// Append-only ledger of audit records
#[derive(Clone)]
pub struct LedgerStore {
    inner: Arc<Inner>,
}

impl LedgerStore {
    /// Non-durable store, used by tests and dry runs
    pub fn in_memory() -> Self {
        Self::from_parts(Vec::new(), None, None, SubjectLinker::ephemeral(), None)
    }

    /// Open the journals under `dir`, replaying records and then overlays.
    ///
    /// A torn final line in either journal is cut off before appending
    /// resumes. Loading does not check the chain; that is the verifier's job.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let records_path = dir.join(RECORDS_FILE);
        let overlays_path = dir.join(OVERLAYS_FILE);
        let linker = SubjectLinker::load_or_create(dir)?;

        let records_replay = journal::replay::<AuditRecord>(&records_path)?;
        let overlays_replay = journal::replay::<OverlayEntry>(&overlays_path)?;
        let records_valid_len = records_replay.valid_len;
        let overlays_valid_len = overlays_replay.valid_len;
        let mut records = records_replay.items;
        let overlays = overlays_replay.items;

        let index: HashMap<u64, usize> = records
            .iter()
            .enumerate()
            .map(|(i, record)| (record.sequence(), i))
            .collect();

        let mut replayed = 0usize;
        for entry in overlays {
            match index.get(&entry.sequence) {
                Some(&i) => {
                    for (field, tombstone) in entry.overlay {
                        if apply_linked(&mut records[i], &field, tombstone, &linker) {
                            replayed += 1;
                        }
                    }
                }
                None => warn!(
                    "Overlay journal references unknown sequence {}",
                    entry.sequence
                ),
            }
        }

        let records_journal = Journal::recover(records_path, records_valid_len)?;
        let overlay_journal = Journal::recover(overlays_path, overlays_valid_len)?;

        info!(
            "Loaded {} ledger records ({} overlay fields replayed) from {}",
            records.len(),
            replayed,
            dir.display()
        );

        Ok(Self::from_parts(
            records,
            Some(records_journal),
            Some(overlay_journal),
            linker,
            Some(dir.to_path_buf()),
        ))
    }

    fn from_parts(
        records: Vec<AuditRecord>,
        records_journal: Option<Journal>,
        overlay_journal: Option<Journal>,
        linker: SubjectLinker,
        data_dir: Option<PathBuf>,
    ) -> Self {
        let tail = records
            .last()
            .map(|r| Tail {
                sequence: r.sequence(),
                chain_hash: r.chain_hash().to_string(),
            })
            .unwrap_or_else(Tail::genesis);
        let last_timestamp = records.iter().map(AuditRecord::timestamp).max();

        let slots: Vec<Arc<Slot>> = records.into_iter().map(|r| Arc::new(Slot::new(r))).collect();
        let published = slots.len();

        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(slots),
                published: AtomicUsize::new(published),
                cursor: Mutex::new(AppendCursor {
                    next_sequence: tail.sequence + 1,
                    tail_hash: tail.chain_hash,
                    last_timestamp,
                    journal: records_journal,
                }),
                overlay_journal: Mutex::new(overlay_journal),
                compaction: Mutex::new(()),
                linker,
                data_dir,
                #[cfg(test)]
                reject_appends: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.inner.data_dir.as_deref()
    }

    /// Pseudonym stamped on records whose actor `actor_id` was redacted
    pub fn actor_link(&self, actor_id: &str) -> String {
        self.inner.linker.link(actor_id)
    }

    /// Seal and persist a new record at the end of the chain.
    ///
    /// Either the record is fully committed with its sequence and both
    /// hashes, or nothing changes: encoding and journal failures leave the
    /// cursor where it was.
    pub async fn append(&self, candidate: EventCandidate) -> Result<AuditRecord> {
        let mut cursor = self.inner.cursor.lock().await;

        #[cfg(test)]
        if self.inner.reject_appends.load(Ordering::SeqCst) {
            return Err(LedgerError::Journal("appends rejected".to_string()));
        }

        let sequence = cursor.next_sequence;
        let timestamp = capture_time(cursor.last_timestamp);
        let content_hash = canonical::content_hash(&CanonicalFields::of_candidate(
            sequence, timestamp, &candidate,
        ))?;
        let chain_hash = canonical::chain_hash(&cursor.tail_hash, &content_hash);
        let record = AuditRecord::seal(sequence, timestamp, candidate, content_hash, chain_hash);

        if let Some(journal) = cursor.journal.as_mut() {
            journal.append(&record)?;
        }

        self.publish(record.clone());
        cursor.next_sequence = sequence + 1;
        cursor.tail_hash = record.chain_hash().to_string();
        cursor.last_timestamp = Some(timestamp);

        debug!("Appended ledger record: {}", record.summary());
        Ok(record)
    }

    fn publish(&self, record: AuditRecord) {
        let mut slots = self
            .inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        slots.push(Arc::new(Slot::new(record)));
        self.inner.published.store(slots.len(), Ordering::Release);
    }

    fn published(&self) -> usize {
        self.inner.published.load(Ordering::Acquire)
    }

    fn slot_at(&self, position: usize) -> Option<Arc<Slot>> {
        if position >= self.published() {
            return None;
        }
        let slots = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        slots.get(position).cloned()
    }

    fn find_slot(&self, sequence: u64) -> Option<Arc<Slot>> {
        let published = self.published();
        let slots = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let visible = &slots[..published.min(slots.len())];

        // Sequences are dense from 1 unless the journal was tampered with
        let direct = usize::try_from(sequence)
            .ok()
            .and_then(|s| s.checked_sub(1))
            .and_then(|i| visible.get(i))
            .filter(|slot| slot.sequence == sequence);

        direct
            .or_else(|| visible.iter().find(|slot| slot.sequence == sequence))
            .cloned()
    }

    fn first_position_from(&self, from_seq: u64) -> usize {
        let published = self.published();
        let slots = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let visible = &slots[..published.min(slots.len())];
        visible.partition_point(|slot| slot.sequence < from_seq)
    }

    /// Lazy, restartable iteration over `[from_seq, to_seq]` in ascending
    /// order. The upper bound is fixed to the tail visible at call time.
    pub fn read_range(&self, from_seq: u64, to_seq: u64) -> RecordRange {
        let from_seq = from_seq.max(1);
        let end = self.published();
        let start = self.first_position_from(from_seq).min(end);
        RecordRange {
            store: self.clone(),
            from_seq,
            to_seq,
            start,
            position: start,
            end,
        }
    }

    pub fn get(&self, sequence: u64) -> Option<AuditRecord> {
        self.find_slot(sequence).map(|slot| slot.snapshot())
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.find_slot(sequence).is_some()
    }

    pub fn len(&self) -> usize {
        self.published()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current head position; `(0, genesis seed)` for an empty ledger
    pub fn tail(&self) -> Tail {
        let published = self.published();
        match published.checked_sub(1).and_then(|last| self.slot_at(last)) {
            Some(slot) => {
                let record = slot.read();
                Tail {
                    sequence: record.sequence(),
                    chain_hash: record.chain_hash().to_string(),
                }
            }
            None => Tail::genesis(),
        }
    }

    /// Write tombstones into a record's overlay.
    ///
    /// Returns the fields that received a new tombstone. Fields without a
    /// recorded value, or already carrying an equal tombstone, are skipped.
    /// If nothing could be applied because every remaining field already
    /// carries a different tombstone, fails with `AlreadyRedacted`.
    pub async fn apply_redaction(
        &self,
        sequence: u64,
        overlay: RedactionOverlay,
    ) -> Result<Vec<FieldPath>> {
        let slot = self
            .find_slot(sequence)
            .ok_or(LedgerError::NotFound { sequence })?;
        let _record_guard = slot.redaction_lock.lock().await;

        let mut to_apply = RedactionOverlay::new();
        let mut conflicts = Vec::new();
        {
            let record = slot.read();
            for (field, tombstone) in overlay {
                match record.tombstone(&field) {
                    Some(existing) if existing.same_redaction(&tombstone) => {}
                    Some(_) => conflicts.push(field.to_string()),
                    None if record.has_value(&field) => {
                        to_apply.insert(field, tombstone);
                    }
                    None => {}
                }
            }
        }

        if to_apply.is_empty() {
            if conflicts.is_empty() {
                return Ok(Vec::new());
            }
            return Err(LedgerError::AlreadyRedacted {
                sequence,
                fields: conflicts,
            });
        }

        // Held across the memory update so compaction never sees a journaled
        // overlay that is not yet applied in memory.
        let mut overlay_journal = self.inner.overlay_journal.lock().await;
        if let Some(journal) = overlay_journal.as_mut() {
            journal.append(&OverlayEntry {
                sequence,
                overlay: to_apply.clone(),
            })?;
        }

        let mut applied = Vec::with_capacity(to_apply.len());
        {
            let mut record = slot.write();
            for (field, tombstone) in to_apply {
                if apply_linked(&mut record, &field, tombstone, &self.inner.linker) {
                    applied.push(field);
                }
            }
        }
        drop(overlay_journal);

        debug!(
            "Applied redaction overlay to sequence {}: {:?}",
            sequence, applied
        );
        Ok(applied)
    }

    /// Rewrite the records journal with every overlay applied and drop the
    /// overlay entries it absorbed, physically removing redacted values
    /// from disk.
    ///
    /// The bulk of the rewrite runs without the append cursor; appends are
    /// held only while the records published meanwhile are copied over and
    /// the files are swapped. Returns the number of records written; zero
    /// for an in-memory store.
    pub async fn compact(&self) -> Result<usize> {
        let Some(dir) = self.inner.data_dir.as_deref() else {
            return Ok(0);
        };
        let _compacting = self.inner.compaction.lock().await;

        // Overlay entries journaled past this mark may postdate the snapshot
        // below, so they stay in the overlay journal.
        let overlay_mark = match self.inner.overlay_journal.lock().await.as_ref() {
            Some(journal) => journal.len()?,
            None => return Ok(0),
        };

        let mut rewrite = Rewrite::create(&dir.join(RECORDS_FILE))?;
        let snapshot = self.read_range(1, u64::MAX);
        let copied = snapshot.snapshot_len();
        for record in snapshot {
            rewrite.write(&record)?;
        }

        let mut cursor = self.inner.cursor.lock().await;
        let mut overlays = self.inner.overlay_journal.lock().await;
        let (Some(records_journal), Some(overlay_journal)) =
            (cursor.journal.as_mut(), overlays.as_mut())
        else {
            return Ok(0);
        };

        let late = self.published().saturating_sub(copied);
        for position in copied..self.published() {
            if let Some(slot) = self.slot_at(position) {
                rewrite.write(&*slot.read())?;
            }
        }
        let written = rewrite.entries();
        records_journal.install(rewrite)?;
        overlay_journal.retain_from(overlay_mark)?;

        info!(
            "Compacted ledger journal: {} records ({} appended during compaction)",
            written, late
        );
        Ok(written)
    }

    /// Records in `[from_seq, to_seq]` passing `filter`, at most `limit`
    /// of them. `Order::Newest` returns the latest matches first.
    pub fn query(
        &self,
        from_seq: u64,
        to_seq: u64,
        filter: &RecordFilter,
        order: Order,
        limit: usize,
    ) -> Vec<AuditRecord> {
        let matching = self
            .read_range(from_seq, to_seq)
            .filter(|record| filter.matches(record));
        match order {
            Order::Oldest => matching.take(limit).collect(),
            Order::Newest => {
                let mut newest = VecDeque::with_capacity(limit.min(1024));
                for record in matching {
                    if newest.len() == limit {
                        newest.pop_front();
                    }
                    if limit > 0 {
                        newest.push_back(record);
                    }
                }
                newest.into_iter().rev().collect()
            }
        }
    }

    pub fn actor_activity(&self, actor: &str) -> ActorActivity {
        let mut activity = ActorActivity {
            actor: actor.to_string(),
            ..ActorActivity::default()
        };
        for record in self
            .read_range(1, u64::MAX)
            .filter(|record| record.actor_ref().is(actor))
        {
            activity.total_actions += 1;
            *activity
                .by_action
                .entry(record.action_kind().to_string())
                .or_default() += 1;
            activity.first_seen.get_or_insert(record.timestamp());
            activity.last_seen = Some(record.timestamp());
        }
        activity
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            tail: self.tail().sequence,
            ..LedgerStats::default()
        };
        for record in self.read_range(1, u64::MAX) {
            stats.total_records += 1;
            if record.is_redacted() {
                stats.redacted_records += 1;
            }
            *stats
                .by_action
                .entry(record.action_kind().to_string())
                .or_default() += 1;
            *stats
                .by_sensitivity
                .entry(record.sensitivity().as_str().to_string())
                .or_default() += 1;
            if let Some(actor) = record.actor_ref().id() {
                *stats.by_actor.entry(actor.to_string()).or_default() += 1;
            }
        }
        stats
    }

    #[cfg(test)]
    pub(crate) fn reject_appends(&self, reject: bool) {
        self.inner.reject_appends.store(reject, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn corrupt_record(&self, sequence: u64, corrupt: impl FnOnce(&mut AuditRecord)) {
        let slot = self.find_slot(sequence).expect("sequence exists");
        corrupt(&mut *slot.write());
    }
}

/// Apply a tombstone, stamping the actor pseudonym first when the actor
/// itself is being scrubbed.
fn apply_linked(
    record: &mut AuditRecord,
    field: &FieldPath,
    tombstone: Tombstone,
    linker: &SubjectLinker,
) -> bool {
    if *field == FieldPath::Actor && record.has_value(field) {
        if let Some(id) = record.actor_ref().id() {
            let link = linker.link(id);
            record.link_actor(link);
        }
    }
    record.apply_tombstone(field, tombstone)
}

/// Capture instant, truncated to microseconds so it survives the JSON
/// journal unchanged, and never earlier than the previous record's.
fn capture_time(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match last {
        Some(last) if now < last => last,
        _ => now,
    }
}

/// Lazy iterator over a snapshot of the ledger
#[derive(Clone)]
pub struct RecordRange {
    store: LedgerStore,
    from_seq: u64,
    to_seq: u64,
    start: usize,
    position: usize,
    end: usize,
}

impl RecordRange {
    /// Rewind to the first record of the range
    pub fn restart(&mut self) {
        self.position = self.start;
    }

    /// Highest position visible to this iterator
    pub fn snapshot_len(&self) -> usize {
        self.end
    }
}

impl Iterator for RecordRange {
    type Item = AuditRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.end {
            let slot = self.store.slot_at(self.position)?;
            self.position += 1;
            if slot.sequence > self.to_seq {
                self.position = self.end;
                return None;
            }
            if slot.sequence >= self.from_seq {
                return Some(slot.snapshot());
            }
        }
        None
    }
}
