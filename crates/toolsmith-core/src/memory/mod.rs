//! # Tool Memory
//!
//! Persistent records of compiled tools, a relation graph between them, and
//! free-text [`MemoryNote`]s.
//!
//! The store is dual-backend:
//! - a local [`MemoryBackend`] (normally [`FlatFileMemory`]) that is always
//!   available and authoritative,
//! - an optional [`Mirror`] (the networked store) written best-effort after
//!   the local commit.
//!
//! A mirror failure is logged and counted, never returned to the caller and
//! never rolls back the local write.

pub mod flat_file;
pub mod graph;
pub mod notes;

pub use flat_file::FlatFileMemory;
pub use graph::{RelatedHit, RelationGraph};
pub use notes::{MemoryNote, NoteKind, NoteStatus, NoteUpdate, merge_note, note_hash, score_note};

use crate::primitives::HASH_SHORT_LEN;
use crate::storage::unix_now;
use crate::{Capability, ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// RECORDS & EDGES
// =============================================================================

/// Advisory metadata about a compiled tool.
///
/// Stored as-is by every backend (JSON and postcard), so no field may be
/// skipped during serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub hash: ToolHash,
    pub app: String,
    pub goal: String,
    pub tags: BTreeSet<String>,
    pub io_signature: String,
    pub pattern: String,
    pub capabilities: BTreeSet<Capability>,
    pub created: u64,
    pub last_used: u64,
    pub use_count: u64,
}

/// A labelled relation between two tools.
///
/// Traversal treats edges as undirected; `from`/`to` record provenance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationEdge {
    pub from: ToolHash,
    pub to: ToolHash,
    pub label: String,
    pub created: u64,
    /// Free-text remark about the relation. Empty when none was given.
    #[serde(default)]
    pub note: String,
}

impl RelationEdge {
    /// Whether two edges describe the same relation (ignoring time and note).
    #[must_use]
    pub fn same_relation(&self, other: &RelationEdge) -> bool {
        self.from == other.from && self.to == other.to && self.label == other.label
    }
}

/// Input to [`MemoryStore::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub hash: ToolHash,
    pub app: String,
    pub goal: String,
    pub tags: BTreeSet<String>,
    pub io_signature: String,
    pub pattern: String,
    pub capabilities: BTreeSet<Capability>,
}

/// Display prefix of a note hash.
#[must_use]
pub fn short_hash(hash: &str) -> &str {
    hash.get(..HASH_SHORT_LEN).unwrap_or(hash)
}

/// Normalize user-supplied tags: trimmed, lowercase, non-empty.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Merge an update into an existing record.
///
/// A non-empty goal replaces the old one, tags are unioned, `created` and
/// usage counters are preserved. Merging the same update twice yields the
/// same record.
#[must_use]
pub fn merge_record(existing: Option<MemoryRecord>, update: &RecordUpdate, now: u64) -> MemoryRecord {
    match existing {
        None => MemoryRecord {
            hash: update.hash.clone(),
            app: update.app.clone(),
            goal: update.goal.trim().to_string(),
            tags: update.tags.clone(),
            io_signature: update.io_signature.clone(),
            pattern: update.pattern.clone(),
            capabilities: update.capabilities.clone(),
            created: now,
            last_used: now,
            use_count: 1,
        },
        Some(mut record) => {
            record.app.clone_from(&update.app);
            let goal = update.goal.trim();
            if !goal.is_empty() {
                record.goal = goal.to_string();
            }
            record.tags.extend(update.tags.iter().cloned());
            record.io_signature.clone_from(&update.io_signature);
            record.pattern.clone_from(&update.pattern);
            record.capabilities.clone_from(&update.capabilities);
            record
        }
    }
}

/// Every record, edge and note of one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub records: BTreeMap<ToolHash, MemoryRecord>,
    pub edges: Vec<RelationEdge>,
    /// Keyed by note hash.
    pub notes: BTreeMap<String, MemoryNote>,
}

// =============================================================================
// BACKEND TRAITS
// =============================================================================

/// A persistent home for memory records and edges.
///
/// Each method is a single atomic step.
pub trait MemoryBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn snapshot(&self) -> Result<MemorySnapshot, ToolsmithError>;

    fn get(&self, hash: &ToolHash) -> Result<Option<MemoryRecord>, ToolsmithError>;

    /// Insert or merge (see [`merge_record`]).
    fn upsert(&self, update: &RecordUpdate, now: u64) -> Result<MemoryRecord, ToolsmithError>;

    /// Bump the use counter of an existing record.
    fn touch(&self, hash: &ToolHash, now: u64) -> Result<Option<MemoryRecord>, ToolsmithError>;

    /// Store a record verbatim, replacing any previous version.
    fn put_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError>;

    /// Add an edge. Re-adding an identical relation is a no-op.
    fn add_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError>;

    /// Insert or merge a note (see [`merge_note`]).
    fn upsert_note(&self, update: &NoteUpdate, now: u64) -> Result<MemoryNote, ToolsmithError>;

    /// Change the status of the note stored under the full `hash`.
    fn set_note_status(
        &self,
        hash: &str,
        status: NoteStatus,
    ) -> Result<Option<MemoryNote>, ToolsmithError>;

    /// Store a note verbatim, replacing any previous version.
    fn put_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError>;
}

/// Best-effort replica of the local store (the networked store).
pub trait Mirror: Send + Sync {
    fn name(&self) -> &str;

    fn publish_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError>;

    fn publish_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError>;

    fn publish_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError>;

    /// Wait up to `timeout` for in-flight writes.
    fn flush(&self, timeout: Duration) -> Result<(), ToolsmithError>;

    /// Failures observed asynchronously by the mirror itself.
    fn failures(&self) -> u64 {
        0
    }
}

/// Read-side view of the build cache used by queries.
pub trait ArtifactProbe {
    fn binary_exists(&self, hash: &ToolHash) -> bool;

    /// The manifest document for `hash`, if the cache still has it.
    fn load_manifest(&self, hash: &ToolHash) -> Result<Option<String>, ToolsmithError>;
}

/// Probe for places with no build cache (the memory server).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArtifacts;

impl ArtifactProbe for NoArtifacts {
    fn binary_exists(&self, _hash: &ToolHash) -> bool {
        false
    }

    fn load_manifest(&self, _hash: &ToolHash) -> Result<Option<String>, ToolsmithError> {
        Ok(None)
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Counts reported by [`MemoryStore::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub records: usize,
    pub edges: usize,
    pub notes: usize,
    pub failed: usize,
}

/// Local backend plus optional mirror.
pub struct MemoryStore {
    local: Box<dyn MemoryBackend>,
    mirror: Option<Box<dyn Mirror>>,
    mirror_failures: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("local", &self.local.name())
            .field("mirror", &self.mirror.as_ref().map(|m| m.name()))
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(local: impl MemoryBackend + 'static) -> Self {
        Self {
            local: Box::new(local),
            mirror: None,
            mirror_failures: AtomicU64::new(0),
        }
    }

    /// Attach a networked mirror.
    #[must_use]
    pub fn with_mirror(mut self, mirror: impl Mirror + 'static) -> Self {
        self.mirror = Some(Box::new(mirror));
        self
    }

    /// Local flat-file store at `path`, no mirror.
    pub fn open_flat_file(path: impl Into<std::path::PathBuf>) -> Result<Self, ToolsmithError> {
        Ok(Self::new(FlatFileMemory::open(path)?))
    }

    #[must_use]
    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn snapshot(&self) -> Result<MemorySnapshot, ToolsmithError> {
        self.local.snapshot()
    }

    pub fn get(&self, hash: &ToolHash) -> Result<Option<MemoryRecord>, ToolsmithError> {
        self.local.get(hash)
    }

    /// Upsert a record locally, then mirror it.
    pub fn record(&self, update: &RecordUpdate) -> Result<MemoryRecord, ToolsmithError> {
        let record = self.local.upsert(update, unix_now())?;
        info!(hash = %record.hash.short(), app = %record.app, "tool recorded");
        self.mirror_record(&record);
        Ok(record)
    }

    /// Mark a known tool as used. Unknown hashes are ignored.
    pub fn touch(&self, hash: &ToolHash) -> Result<Option<MemoryRecord>, ToolsmithError> {
        let touched = self.local.touch(hash, unix_now())?;
        if let Some(record) = &touched {
            debug!(hash = %hash.short(), uses = record.use_count, "tool used");
            self.mirror_record(record);
        }
        Ok(touched)
    }

    /// Store a replicated record verbatim. Used by the memory server, where
    /// the client's counters and timestamps are authoritative.
    pub fn put(&self, record: &MemoryRecord) -> Result<(), ToolsmithError> {
        self.local.put_record(record)?;
        debug!(hash = %record.hash.short(), "record replicated");
        self.mirror_record(record);
        Ok(())
    }

    /// Store an edge whose endpoints the caller has already resolved.
    pub fn add_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError> {
        self.local.add_edge(edge)?;
        info!(
            from = %edge.from.short(),
            to = %edge.to.short(),
            label = %edge.label,
            "relation added"
        );
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.publish_edge(edge) {
                self.note_mirror_failure(mirror.name(), &e);
            }
        }
        Ok(())
    }

    /// Record a note locally, then mirror it. Same kind and summary merge
    /// into one note.
    pub fn note(&self, update: &NoteUpdate) -> Result<MemoryNote, ToolsmithError> {
        let note = self.local.upsert_note(update, unix_now())?;
        info!(hash = %short_hash(&note.hash), kind = %note.kind, "note recorded");
        self.mirror_note(&note);
        Ok(note)
    }

    /// Change a note's status. `hash` must be a full note hash.
    pub fn set_note_status(
        &self,
        hash: &str,
        status: NoteStatus,
    ) -> Result<MemoryNote, ToolsmithError> {
        let note = self
            .local
            .set_note_status(hash, status)?
            .ok_or_else(|| ToolsmithError::RecordNotFound {
                prefix: hash.to_string(),
            })?;
        info!(hash = %short_hash(hash), status = %status, "note status changed");
        self.mirror_note(&note);
        Ok(note)
    }

    /// Store a replicated note verbatim.
    pub fn put_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError> {
        self.local.put_note(note)?;
        debug!(hash = %short_hash(&note.hash), "note replicated");
        self.mirror_note(note);
        Ok(())
    }

    /// Most recently used records first.
    pub fn log(&self, limit: usize) -> Result<Vec<MemoryRecord>, ToolsmithError> {
        let mut records: Vec<MemoryRecord> = self.local.snapshot()?.records.into_values().collect();
        records.sort_by(|a, b| {
            b.last_used
                .cmp(&a.last_used)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        records.truncate(limit);
        Ok(records)
    }

    /// Re-publish every local record and edge to the mirror.
    pub fn sync(&self) -> Result<SyncReport, ToolsmithError> {
        let Some(mirror) = &self.mirror else {
            return Err(ToolsmithError::Mirror("no remote memory configured".to_string()));
        };
        let snapshot = self.local.snapshot()?;
        let mut report = SyncReport::default();
        for record in snapshot.records.values() {
            match mirror.publish_record(record) {
                Ok(()) => report.records += 1,
                Err(e) => {
                    self.note_mirror_failure(mirror.name(), &e);
                    report.failed += 1;
                }
            }
        }
        for edge in &snapshot.edges {
            match mirror.publish_edge(edge) {
                Ok(()) => report.edges += 1,
                Err(e) => {
                    self.note_mirror_failure(mirror.name(), &e);
                    report.failed += 1;
                }
            }
        }
        for note in snapshot.notes.values() {
            match mirror.publish_note(note) {
                Ok(()) => report.notes += 1,
                Err(e) => {
                    self.note_mirror_failure(mirror.name(), &e);
                    report.failed += 1;
                }
            }
        }
        info!(
            records = report.records,
            edges = report.edges,
            notes = report.notes,
            failed = report.failed,
            "sync queued"
        );
        Ok(report)
    }

    /// Wait for in-flight mirror writes. Called once at process end.
    pub fn flush(&self, timeout: Duration) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.flush(timeout) {
                self.note_mirror_failure(mirror.name(), &e);
            }
        }
    }

    /// Mirror writes that failed so far, synchronous and asynchronous.
    #[must_use]
    pub fn mirror_failures(&self) -> u64 {
        let sync_failures = self.mirror_failures.load(Ordering::Relaxed);
        let async_failures = self.mirror.as_ref().map_or(0, |m| m.failures());
        sync_failures.saturating_add(async_failures)
    }

    fn mirror_record(&self, record: &MemoryRecord) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.publish_record(record) {
                self.note_mirror_failure(mirror.name(), &e);
            }
        }
    }

    fn mirror_note(&self, note: &MemoryNote) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.publish_note(note) {
                self.note_mirror_failure(mirror.name(), &e);
            }
        }
    }

    fn note_mirror_failure(&self, mirror: &str, error: &ToolsmithError) {
        self.mirror_failures.fetch_add(1, Ordering::Relaxed);
        warn!(mirror, error = %error, "mirror write failed; local store is authoritative");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn update(goal: &str, tags: &[&str]) -> RecordUpdate {
        RecordUpdate {
            hash: ToolHash::new("a".repeat(64)),
            app: "sum".to_string(),
            goal: goal.to_string(),
            tags: normalize_tags(tags),
            io_signature: "num,num -> num".to_string(),
            pattern: "arg_num>arg_num>add>print_num".to_string(),
            capabilities: [Capability::IoWrite].into_iter().collect(),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let u = update("add two numbers", &["math"]);
        let first = merge_record(None, &u, 100);
        let second = merge_record(Some(first.clone()), &u, 200);
        assert_eq!(first, second);
        assert_eq!(second.created, 100);
    }

    #[test]
    fn merge_unions_tags_and_keeps_goal() {
        let first = merge_record(None, &update("add two numbers", &["math"]), 1);
        let merged = merge_record(Some(first), &update("", &["Cli", " "]), 2);
        assert_eq!(merged.goal, "add two numbers");
        assert_eq!(
            merged.tags.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["cli", "math"]
        );
    }

    #[test]
    fn no_artifacts_probe() {
        let probe = NoArtifacts;
        assert!(!probe.binary_exists(&ToolHash::new("x")));
        assert!(probe.load_manifest(&ToolHash::new("x")).unwrap().is_none());
    }
}
