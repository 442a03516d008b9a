//! # redb-backed Memory Storage
//!
//! The memory server's backend. Records, edges and notes live in a single redb
//! file, each value postcard-encoded. Every operation is one transaction, so
//! a crashed server never leaves a half-applied upsert behind.

use crate::memory::{
    MemoryBackend, MemoryNote, MemoryRecord, MemorySnapshot, NoteStatus, NoteUpdate, RecordUpdate,
    RelationEdge, merge_note, merge_record,
};
use crate::primitives::MEMORY_FORMAT_VERSION;
use crate::{ToolHash, ToolsmithError};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

/// Table for records: hash -> postcard MemoryRecord
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Table for edges: sequence number -> postcard RelationEdge
const EDGES: TableDefinition<u64, &[u8]> = TableDefinition::new("edges");

/// Table for notes: note hash -> postcard MemoryNote
const NOTES: TableDefinition<&str, &[u8]> = TableDefinition::new("notes");

/// Table for metadata: key -> u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const KEY_FORMAT: &str = "format_version";
const KEY_NEXT_EDGE: &str = "next_edge_id";

fn db_err(e: impl std::fmt::Display) -> ToolsmithError {
    ToolsmithError::Storage(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ToolsmithError> {
    postcard::to_allocvec(value).map_err(db_err)
}

fn decode<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ToolsmithError> {
    postcard::from_bytes(bytes).map_err(db_err)
}

/// Disk-backed memory store.
pub struct RedbMemory {
    db: Database,
}

impl std::fmt::Debug for RedbMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbMemory").finish_non_exhaustive()
    }
}

impl RedbMemory {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ToolsmithError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;

        let write_txn = db.begin_write().map_err(db_err)?;
        {
            let _ = write_txn.open_table(RECORDS).map_err(db_err)?;
            let _ = write_txn.open_table(EDGES).map_err(db_err)?;
            let _ = write_txn.open_table(NOTES).map_err(db_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(db_err)?;
            let version = meta.get(KEY_FORMAT).map_err(db_err)?.map(|v| v.value());
            match version {
                None => {
                    meta.insert(KEY_FORMAT, u64::from(MEMORY_FORMAT_VERSION))
                        .map_err(db_err)?;
                }
                Some(v) if v == u64::from(MEMORY_FORMAT_VERSION) => {}
                Some(v) => {
                    return Err(ToolsmithError::Storage(format!(
                        "memory database has format version {v}, expected {MEMORY_FORMAT_VERSION}"
                    )));
                }
            }
        }
        write_txn.commit().map_err(db_err)?;

        Ok(Self { db })
    }

    /// Number of stored records.
    pub fn record_count(&self) -> Result<u64, ToolsmithError> {
        use redb::ReadableTableMetadata;
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(RECORDS).map_err(db_err)?;
        table.len().map_err(db_err)
    }
}

impl MemoryBackend for RedbMemory {
    fn name(&self) -> &str {
        "redb"
    }

    fn snapshot(&self) -> Result<MemorySnapshot, ToolsmithError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;

        let mut records = BTreeMap::new();
        let table = read_txn.open_table(RECORDS).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)? {
            let (_, value) = entry.map_err(db_err)?;
            let record: MemoryRecord = decode(value.value())?;
            records.insert(record.hash.clone(), record);
        }

        let mut edges = Vec::new();
        let table = read_txn.open_table(EDGES).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)? {
            let (_, value) = entry.map_err(db_err)?;
            edges.push(decode(value.value())?);
        }

        let mut notes = BTreeMap::new();
        let table = read_txn.open_table(NOTES).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)? {
            let (_, value) = entry.map_err(db_err)?;
            let note: MemoryNote = decode(value.value())?;
            notes.insert(note.hash.clone(), note);
        }

        Ok(MemorySnapshot {
            records,
            edges,
            notes,
        })
    }

    fn get(&self, hash: &ToolHash) -> Result<Option<MemoryRecord>, ToolsmithError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(RECORDS).map_err(db_err)?;
        match table.get(hash.as_str()).map_err(db_err)? {
            Some(value) => decode(value.value()).map(Some),
            None => Ok(None),
        }
    }

    fn upsert(&self, update: &RecordUpdate, now: u64) -> Result<MemoryRecord, ToolsmithError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let merged = {
            let mut table = write_txn.open_table(RECORDS).map_err(db_err)?;
            let existing: Option<MemoryRecord> = match table.get(update.hash.as_str()).map_err(db_err)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            let merged = merge_record(existing, update, now);
            let bytes = encode(&merged)?;
            table
                .insert(merged.hash.as_str(), bytes.as_slice())
                .map_err(db_err)?;
            merged
        };
        write_txn.commit().map_err(db_err)?;
        Ok(merged)
    }

    fn touch(&self, hash: &ToolHash, now: u64) -> Result<Option<MemoryRecord>, ToolsmithError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let touched = {
            let mut table = write_txn.open_table(RECORDS).map_err(db_err)?;
            let existing: Option<MemoryRecord> = match table.get(hash.as_str()).map_err(db_err)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            match existing {
                Some(mut record) => {
                    record.use_count = record.use_count.saturating_add(1);
                    record.last_used = now;
                    let bytes = encode(&record)?;
                    table.insert(hash.as_str(), bytes.as_slice()).map_err(db_err)?;
                    Some(record)
                }
                None => None,
            }
        };
        write_txn.commit().map_err(db_err)?;
        Ok(touched)
    }

    fn put_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(RECORDS).map_err(db_err)?;
            table
                .insert(record.hash.as_str(), bytes.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)
    }

    fn add_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut edges = write_txn.open_table(EDGES).map_err(db_err)?;
            for entry in edges.iter().map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                let existing: RelationEdge = decode(value.value())?;
                if existing.same_relation(edge) {
                    return Ok(());
                }
            }

            let mut meta = write_txn.open_table(METADATA).map_err(db_err)?;
            let id = meta
                .get(KEY_NEXT_EDGE)
                .map_err(db_err)?
                .map(|v| v.value())
                .unwrap_or(0);
            let bytes = encode(edge)?;
            edges.insert(id, bytes.as_slice()).map_err(db_err)?;
            meta.insert(KEY_NEXT_EDGE, id.saturating_add(1))
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)
    }

    fn upsert_note(&self, update: &NoteUpdate, now: u64) -> Result<MemoryNote, ToolsmithError> {
        let hash = update.hash();
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let merged = {
            let mut table = write_txn.open_table(NOTES).map_err(db_err)?;
            let existing: Option<MemoryNote> = match table.get(hash.as_str()).map_err(db_err)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            let merged = merge_note(existing, update, now);
            let bytes = encode(&merged)?;
            table.insert(hash.as_str(), bytes.as_slice()).map_err(db_err)?;
            merged
        };
        write_txn.commit().map_err(db_err)?;
        Ok(merged)
    }

    fn set_note_status(
        &self,
        hash: &str,
        status: NoteStatus,
    ) -> Result<Option<MemoryNote>, ToolsmithError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let updated = {
            let mut table = write_txn.open_table(NOTES).map_err(db_err)?;
            let existing: Option<MemoryNote> = match table.get(hash).map_err(db_err)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            match existing {
                Some(mut note) => {
                    note.status = status;
                    let bytes = encode(&note)?;
                    table.insert(hash, bytes.as_slice()).map_err(db_err)?;
                    Some(note)
                }
                None => None,
            }
        };
        write_txn.commit().map_err(db_err)?;
        Ok(updated)
    }

    fn put_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError> {
        let bytes = encode(note)?;
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(NOTES).map_err(db_err)?;
            table
                .insert(note.hash.as_str(), bytes.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::Capability;
    use crate::memory::normalize_tags;
    use tempfile::tempdir;

    fn update(hash: char, goal: &str) -> RecordUpdate {
        RecordUpdate {
            hash: ToolHash::new(hash.to_string().repeat(64)),
            app: "fetch".to_string(),
            goal: goal.to_string(),
            tags: normalize_tags(["net"]),
            io_signature: "str -> str".to_string(),
            pattern: "arg_str>http_get>print_str".to_string(),
            capabilities: [Capability::NetRead, Capability::IoWrite].into_iter().collect(),
        }
    }

    #[test]
    fn upsert_and_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.redb");
        {
            let db = RedbMemory::open(&path).unwrap();
            db.upsert(&update('a', "fetch a url"), 5).unwrap();
            db.upsert(&update('a', ""), 6).unwrap();
            db.touch(&ToolHash::new("a".repeat(64)), 7).unwrap();
            assert_eq!(db.record_count().unwrap(), 1);
        }
        let db = RedbMemory::open(&path).unwrap();
        let record = db.get(&ToolHash::new("a".repeat(64))).unwrap().unwrap();
        assert_eq!(record.goal, "fetch a url");
        assert_eq!((record.created, record.last_used, record.use_count), (5, 7, 2));
        assert_eq!(record.capabilities.len(), 2);
    }

    #[test]
    fn edges_keep_order_and_skip_duplicates() {
        let dir = tempdir().expect("temp dir");
        let db = RedbMemory::open(dir.path().join("memory.redb")).unwrap();
        let first = RelationEdge {
            from: ToolHash::new("a".repeat(64)),
            to: ToolHash::new("b".repeat(64)),
            label: "feeds".to_string(),
            created: 1,
            note: "raw lines".to_string(),
        };
        let second = RelationEdge {
            label: "wraps".to_string(),
            ..first.clone()
        };
        db.add_edge(&first).unwrap();
        db.add_edge(&second).unwrap();
        db.add_edge(&first).unwrap();
        assert_eq!(db.snapshot().unwrap().edges, vec![first, second]);
    }

    #[test]
    fn notes_survive_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("memory.redb");
        let update = NoteUpdate::new(
            crate::NoteKind::Issue,
            "mirror drops writes on shutdown",
            "flush before exit",
            "remote",
            ["mirror"],
        )
        .unwrap();
        let hash = {
            let db = RedbMemory::open(&path).unwrap();
            let note = db.upsert_note(&update, 4).unwrap();
            db.set_note_status(&note.hash, NoteStatus::Superseded).unwrap().unwrap();
            note.hash
        };
        let db = RedbMemory::open(&path).unwrap();
        let note = db.snapshot().unwrap().notes.remove(&hash).unwrap();
        assert_eq!(note.status, NoteStatus::Superseded);
        assert_eq!((note.created, note.detail.as_str()), (4, "flush before exit"));
    }

    #[test]
    fn put_record_replaces() {
        let dir = tempdir().expect("temp dir");
        let db = RedbMemory::open(dir.path().join("memory.redb")).unwrap();
        let mut record = db.upsert(&update('c', "first"), 1).unwrap();
        record.goal = "replaced".to_string();
        record.use_count = 9;
        db.put_record(&record).unwrap();
        assert_eq!(db.get(&record.hash).unwrap(), Some(record));
    }
}
