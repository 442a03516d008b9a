//! Local memory backend: one JSON document rewritten atomically.
//!
//! Every mutation reloads the document under a lock file, applies the change
//! and writes the whole document back, so concurrent processes never lose
//! each other's updates.

use super::{
    MemoryBackend, MemoryNote, MemoryRecord, MemorySnapshot, NoteStatus, NoteUpdate, RecordUpdate,
    RelationEdge, merge_note, merge_record,
};
use crate::primitives::MEMORY_FORMAT_VERSION;
use crate::storage::{LockFile, write_atomic};
use crate::{ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryDocument {
    version: u32,
    records: Vec<MemoryRecord>,
    edges: Vec<RelationEdge>,
    #[serde(default)]
    notes: Vec<MemoryNote>,
}

impl MemoryDocument {
    fn into_snapshot(self) -> MemorySnapshot {
        MemorySnapshot {
            records: self
                .records
                .into_iter()
                .map(|r| (r.hash.clone(), r))
                .collect(),
            edges: self.edges,
            notes: self
                .notes
                .into_iter()
                .map(|n| (n.hash.clone(), n))
                .collect(),
        }
    }

    fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            version: MEMORY_FORMAT_VERSION,
            records: snapshot.records.into_values().collect(),
            edges: snapshot.edges,
            notes: snapshot.notes.into_values().collect(),
        }
    }
}

/// `memory.json` under the tool home.
#[derive(Debug)]
pub struct FlatFileMemory {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FlatFileMemory {
    /// Open (or lazily create) the document at `path`.
    ///
    /// An existing document is read once so a corrupt or newer-format file
    /// is reported at startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ToolsmithError> {
        let memory = Self {
            path: path.into(),
            guard: Mutex::new(()),
        };
        memory.load()?;
        Ok(memory)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<MemorySnapshot, ToolsmithError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MemorySnapshot::default());
            }
            Err(e) => return Err(ToolsmithError::storage(e)),
        };
        let doc: MemoryDocument = serde_json::from_slice(&bytes).map_err(|e| {
            ToolsmithError::Storage(format!("corrupt memory file {}: {e}", self.path.display()))
        })?;
        // version 1 documents lack notes and edge notes, which default to empty
        if doc.version == 0 || doc.version > MEMORY_FORMAT_VERSION {
            return Err(ToolsmithError::Storage(format!(
                "memory file {} has format version {}, expected at most {MEMORY_FORMAT_VERSION}",
                self.path.display(),
                doc.version
            )));
        }
        Ok(doc.into_snapshot())
    }

    fn save(&self, snapshot: MemorySnapshot) -> Result<(), ToolsmithError> {
        let doc = MemoryDocument::from_snapshot(snapshot);
        let json = serde_json::to_vec_pretty(&doc).map_err(ToolsmithError::storage)?;
        write_atomic(&self.path, &json)
    }

    /// Reload, apply `f`, write back. `f` returns `None` to skip the write.
    fn modify<T>(
        &self,
        f: impl FnOnce(&mut MemorySnapshot) -> Option<T>,
    ) -> Result<Option<T>, ToolsmithError> {
        let _local = self
            .guard
            .lock()
            .map_err(|_| ToolsmithError::Storage("memory lock poisoned".to_string()))?;
        let _lock = LockFile::acquire(&self.path.with_extension("lock"), LOCK_TIMEOUT)?;
        let mut snapshot = self.load()?;
        let out = f(&mut snapshot);
        if out.is_some() {
            self.save(snapshot)?;
        }
        Ok(out)
    }
}

impl MemoryBackend for FlatFileMemory {
    fn name(&self) -> &str {
        "flat-file"
    }

    fn snapshot(&self) -> Result<MemorySnapshot, ToolsmithError> {
        self.load()
    }

    fn get(&self, hash: &ToolHash) -> Result<Option<MemoryRecord>, ToolsmithError> {
        Ok(self.load()?.records.remove(hash))
    }

    fn upsert(&self, update: &RecordUpdate, now: u64) -> Result<MemoryRecord, ToolsmithError> {
        let merged = self.modify(|snapshot| {
            let existing = snapshot.records.remove(&update.hash);
            let merged = merge_record(existing, update, now);
            snapshot.records.insert(merged.hash.clone(), merged.clone());
            Some(merged)
        })?;
        merged.ok_or_else(|| ToolsmithError::Storage("upsert produced no record".to_string()))
    }

    fn touch(&self, hash: &ToolHash, now: u64) -> Result<Option<MemoryRecord>, ToolsmithError> {
        self.modify(|snapshot| {
            let record = snapshot.records.get_mut(hash)?;
            record.use_count = record.use_count.saturating_add(1);
            record.last_used = now;
            Some(record.clone())
        })
    }

    fn put_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError> {
        self.modify(|snapshot| {
            snapshot.records.insert(record.hash.clone(), record.clone());
            Some(())
        })?;
        Ok(())
    }

    fn add_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError> {
        self.modify(|snapshot| {
            if snapshot.edges.iter().any(|e| e.same_relation(edge)) {
                return None;
            }
            snapshot.edges.push(edge.clone());
            Some(())
        })?;
        Ok(())
    }

    fn upsert_note(&self, update: &NoteUpdate, now: u64) -> Result<MemoryNote, ToolsmithError> {
        let merged = self.modify(|snapshot| {
            let existing = snapshot.notes.remove(&update.hash());
            let merged = merge_note(existing, update, now);
            snapshot.notes.insert(merged.hash.clone(), merged.clone());
            Some(merged)
        })?;
        merged.ok_or_else(|| ToolsmithError::Storage("note upsert produced no note".to_string()))
    }

    fn set_note_status(
        &self,
        hash: &str,
        status: NoteStatus,
    ) -> Result<Option<MemoryNote>, ToolsmithError> {
        self.modify(|snapshot| {
            let note = snapshot.notes.get_mut(hash)?;
            note.status = status;
            Some(note.clone())
        })
    }

    fn put_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError> {
        self.modify(|snapshot| {
            snapshot.notes.insert(note.hash.clone(), note.clone());
            Some(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::memory::normalize_tags;
    use tempfile::tempdir;

    fn update(hash: char) -> RecordUpdate {
        RecordUpdate {
            hash: ToolHash::new(hash.to_string().repeat(64)),
            app: "echo".to_string(),
            goal: "echo a line".to_string(),
            tags: normalize_tags(["text"]),
            io_signature: "str -> str".to_string(),
            pattern: "read_line>print_str".to_string(),
            capabilities: Default::default(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().expect("temp dir");
        let memory = FlatFileMemory::open(dir.path().join("memory.json")).unwrap();
        assert!(memory.snapshot().unwrap().records.is_empty());
        assert!(!memory.path().exists());
    }

    #[test]
    fn upsert_touch_and_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.json");
        let memory = FlatFileMemory::open(&path).unwrap();
        let record = memory.upsert(&update('a'), 10).unwrap();
        assert_eq!(record.use_count, 1);
        let touched = memory.touch(&record.hash, 20).unwrap().unwrap();
        assert_eq!((touched.use_count, touched.last_used), (2, 20));
        assert!(memory.touch(&ToolHash::new("f".repeat(64)), 30).unwrap().is_none());

        let reopened = FlatFileMemory::open(&path).unwrap();
        assert_eq!(reopened.get(&record.hash).unwrap(), Some(touched));
    }

    #[test]
    fn duplicate_edge_is_stored_once() {
        let dir = tempdir().expect("temp dir");
        let memory = FlatFileMemory::open(dir.path().join("memory.json")).unwrap();
        let edge = RelationEdge {
            from: ToolHash::new("a".repeat(64)),
            to: ToolHash::new("b".repeat(64)),
            label: "pairs_with".to_string(),
            created: 1,
            note: String::new(),
        };
        memory.add_edge(&edge).unwrap();
        memory.add_edge(&RelationEdge { created: 2, ..edge.clone() }).unwrap();
        assert_eq!(memory.snapshot().unwrap().edges, vec![edge]);
    }

    #[test]
    fn notes_merge_and_change_status() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.json");
        let memory = FlatFileMemory::open(&path).unwrap();
        let update = NoteUpdate::new(
            crate::NoteKind::Decision,
            "keep one json document",
            "",
            "memory",
            ["storage"],
        )
        .unwrap();
        let first = memory.upsert_note(&update, 5).unwrap();
        let again = memory.upsert_note(&update, 9).unwrap();
        assert_eq!(first, again);

        let resolved = memory
            .set_note_status(&first.hash, NoteStatus::Resolved)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, NoteStatus::Resolved);
        assert!(memory.set_note_status("ffff", NoteStatus::Resolved).unwrap().is_none());

        let reopened = FlatFileMemory::open(&path).unwrap();
        let notes = reopened.snapshot().unwrap().notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes.get(&first.hash), Some(&resolved));
    }

    #[test]
    fn version_one_document_still_loads() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.json");
        let hash = "a".repeat(64);
        let doc = format!(
            r#"{{"version":1,"records":[],"edges":[{{"from":"{hash}","to":"{hash}","label":"self","created":3}}]}}"#
        );
        std::fs::write(&path, doc).unwrap();
        let snapshot = FlatFileMemory::open(&path).unwrap().snapshot().unwrap();
        assert_eq!(snapshot.edges[0].note, "");
        assert!(snapshot.notes.is_empty());
    }

    #[test]
    fn newer_format_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.json");
        std::fs::write(&path, br#"{"version":99,"records":[],"edges":[]}"#).unwrap();
        let err = FlatFileMemory::open(&path).unwrap_err();
        assert!(err.to_string().contains("format version 99"));
    }
}
