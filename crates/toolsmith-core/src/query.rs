//! # Query Layer
//!
//! Read and relate operations over the memory store:
//! - `search`: keyword ranking over goal, tags, app, pattern and IO signature
//! - `show`: hash-prefix lookup with the full manifest loaded on demand
//! - `related`: breadth-first neighbors in the relation graph
//! - `relate`: edge insertion between two resolved tools
//! - `notes` / `search_notes` / `resolve_note`: the note side of the store
//!
//! The pure functions operate on a [`MemorySnapshot`] so the memory server
//! and the CLI share one implementation. [`MemoryQuery`] binds them to a
//! live store and a build cache.

use crate::memory::{
    ArtifactProbe, MemoryNote, MemoryRecord, MemorySnapshot, MemoryStore, NoteKind, NoteStatus,
    RelatedHit, RelationEdge, RelationGraph, score_note,
};
use crate::primitives::{DEFAULT_NOTES_LIMIT, DEFAULT_SEARCH_LIMIT, MAX_LABEL_LEN};
use crate::storage::unix_now;
use crate::{ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Compact view of a record, used in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub hash: ToolHash,
    pub short: String,
    pub app: String,
    pub goal: String,
    pub io_signature: String,
    pub tags: Vec<String>,
    pub use_count: u64,
    pub binary_exists: bool,
}

impl RecordSummary {
    #[must_use]
    pub fn from_record(record: &MemoryRecord, probe: &dyn ArtifactProbe) -> Self {
        Self {
            hash: record.hash.clone(),
            short: record.hash.short().to_string(),
            app: record.app.clone(),
            goal: record.goal.clone(),
            io_signature: record.io_signature.clone(),
            tags: record.tags.iter().cloned().collect(),
            use_count: record.use_count,
            binary_exists: probe.binary_exists(&record.hash),
        }
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: u32,
    #[serde(flatten)]
    pub summary: RecordSummary,
}

/// A ranked note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteHit {
    pub score: u32,
    #[serde(flatten)]
    pub note: MemoryNote,
}

/// Full record plus the manifest it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDetails {
    pub record: MemoryRecord,
    pub binary_exists: bool,
    /// `None` when the artifact is no longer cached.
    pub manifest: Option<serde_json::Value>,
}

/// One edge reached by `related`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntry {
    pub from: ToolHash,
    pub to: ToolHash,
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    pub depth: usize,
    pub neighbor_hash: ToolHash,
    /// `None` when the neighbor has no record in this store.
    pub neighbor: Option<RecordSummary>,
}

// =============================================================================
// PURE OPERATIONS
// =============================================================================

/// Keyword score of one record. Zero means no match.
#[must_use]
pub fn score_record(record: &MemoryRecord, keywords: &[String]) -> u32 {
    let goal = record.goal.to_lowercase();
    let app = record.app.to_lowercase();
    let pattern = record.pattern.to_lowercase();
    let io = record.io_signature.to_lowercase();

    let mut score = 0u32;
    for keyword in keywords {
        if goal.contains(keyword.as_str()) {
            score += 3;
        }
        for tag in &record.tags {
            if tag == keyword {
                score += 3;
            } else if tag.contains(keyword.as_str()) {
                score += 1;
            }
        }
        if app.contains(keyword.as_str()) {
            score += 2;
        }
        if pattern.contains(keyword.as_str()) {
            score += 1;
        }
        if io.contains(keyword.as_str()) {
            score += 1;
        }
    }
    score
}

/// Rank records against `query`. A `limit` of 0 means the default.
#[must_use]
pub fn search(
    snapshot: &MemorySnapshot,
    probe: &dyn ArtifactProbe,
    query: &str,
    limit: usize,
) -> Vec<SearchHit> {
    let keywords: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };

    let mut scored: Vec<(u32, &MemoryRecord)> = snapshot
        .records
        .values()
        .map(|r| (score_record(r, &keywords), r))
        .filter(|(score, _)| *score > 0)
        .collect();
    // records iterate in hash order, so a stable sort keeps ties by hash
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(score, record)| SearchHit {
            score,
            summary: RecordSummary::from_record(record, probe),
        })
        .collect()
}

/// Resolve a hash prefix to exactly one record.
pub fn resolve_prefix<'a>(
    snapshot: &'a MemorySnapshot,
    prefix: &str,
) -> Result<&'a MemoryRecord, ToolsmithError> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        return Err(ToolsmithError::RecordNotFound { prefix });
    }

    let matches = snapshot
        .records
        .range(ToolHash::new(prefix.clone())..)
        .map(|(hash, record)| (hash.as_str(), record));
    pick_unique(prefix, matches)
}

/// Resolve a hash prefix to exactly one note.
pub fn resolve_note_prefix<'a>(
    snapshot: &'a MemorySnapshot,
    prefix: &str,
) -> Result<&'a MemoryNote, ToolsmithError> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        return Err(ToolsmithError::RecordNotFound { prefix });
    }
    let matches = snapshot
        .notes
        .range(prefix.clone()..)
        .map(|(hash, note)| (hash.as_str(), note));
    pick_unique(prefix, matches)
}

/// First entry of a sorted run starting at `prefix`, if it is the only one
/// with that prefix.
fn pick_unique<'a, T>(
    prefix: String,
    sorted_from_prefix: impl Iterator<Item = (&'a str, &'a T)>,
) -> Result<&'a T, ToolsmithError> {
    let needle = prefix.clone();
    let mut matches = sorted_from_prefix.take_while(move |(hash, _)| hash.starts_with(&needle));
    let Some((first_hash, first)) = matches.next() else {
        return Err(ToolsmithError::RecordNotFound { prefix });
    };
    let rest: Vec<&str> = matches.map(|(hash, _)| hash).collect();
    if rest.is_empty() {
        return Ok(first);
    }
    let candidates = std::iter::once(first_hash)
        .chain(rest)
        .map(str::to_string)
        .collect();
    Err(ToolsmithError::AmbiguousHashPrefix { prefix, candidates })
}

/// The record named by `prefix` with its manifest.
pub fn show(
    snapshot: &MemorySnapshot,
    probe: &dyn ArtifactProbe,
    prefix: &str,
) -> Result<ToolDetails, ToolsmithError> {
    let record = resolve_prefix(snapshot, prefix)?;
    let manifest = probe.load_manifest(&record.hash)?.map(|text| {
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    });
    Ok(ToolDetails {
        record: record.clone(),
        binary_exists: probe.binary_exists(&record.hash),
        manifest,
    })
}

/// Tools within `depth` hops of the one named by `prefix`.
pub fn related(
    snapshot: &MemorySnapshot,
    probe: &dyn ArtifactProbe,
    prefix: &str,
    depth: usize,
) -> Result<Vec<RelatedEntry>, ToolsmithError> {
    let start = resolve_prefix(snapshot, prefix)?;
    let graph = RelationGraph::build(&snapshot.edges);
    Ok(graph
        .traverse(&start.hash, depth)
        .into_iter()
        .map(|RelatedHit { neighbor, edge, depth }| RelatedEntry {
            neighbor: snapshot
                .records
                .get(&neighbor)
                .map(|r| RecordSummary::from_record(r, probe)),
            neighbor_hash: neighbor,
            from: edge.from,
            to: edge.to,
            label: edge.label,
            note: edge.note,
            depth,
        })
        .collect())
}

/// Check a relation label: non-empty, at most [`MAX_LABEL_LEN`] bytes.
pub fn check_label(label: &str) -> Result<&str, ToolsmithError> {
    let label = label.trim();
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(ToolsmithError::Parse {
            detail: format!("relation label must be 1 to {MAX_LABEL_LEN} bytes, got {}", label.len()),
        });
    }
    Ok(label)
}

/// Build the edge for `relate` without storing it. Both endpoints must
/// resolve before anything is written.
pub fn prepare_edge(
    snapshot: &MemorySnapshot,
    from: &str,
    to: &str,
    label: &str,
    note: &str,
    now: u64,
) -> Result<RelationEdge, ToolsmithError> {
    let from = resolve_prefix(snapshot, from)?;
    let to = resolve_prefix(snapshot, to)?;
    let label = check_label(label)?;
    Ok(RelationEdge {
        from: from.hash.clone(),
        to: to.hash.clone(),
        label: label.to_string(),
        created: now,
        note: note.trim().to_string(),
    })
}

/// Notes newest first, optionally filtered by kind and exact context.
/// A `limit` of 0 means the default.
#[must_use]
pub fn list_notes(
    snapshot: &MemorySnapshot,
    kind: Option<NoteKind>,
    context: Option<&str>,
    limit: usize,
) -> Vec<MemoryNote> {
    let limit = if limit == 0 { DEFAULT_NOTES_LIMIT } else { limit };
    let context = context.map(str::trim);
    let mut notes: Vec<&MemoryNote> = snapshot
        .notes
        .values()
        .filter(|n| kind.is_none_or(|k| n.kind == k))
        .filter(|n| context.is_none_or(|c| n.context == c))
        .collect();
    notes.sort_by(|a, b| b.created.cmp(&a.created));
    notes.into_iter().take(limit).cloned().collect()
}

/// Rank notes against `query`. Resolved and superseded notes rank like
/// active ones; callers filter on `status` if they care.
#[must_use]
pub fn search_notes(snapshot: &MemorySnapshot, query: &str, limit: usize) -> Vec<NoteHit> {
    let keywords: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    let limit = if limit == 0 { DEFAULT_NOTES_LIMIT } else { limit };
    let mut scored: Vec<(u32, &MemoryNote)> = snapshot
        .notes
        .values()
        .map(|n| (score_note(n, &keywords), n))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(limit)
        .map(|(score, note)| NoteHit {
            score,
            note: note.clone(),
        })
        .collect()
}

/// Notes of `kind` in `context`: ranked by `query` when it has keywords,
/// newest first otherwise.
#[must_use]
pub fn find_notes(
    snapshot: &MemorySnapshot,
    query: Option<&str>,
    kind: Option<NoteKind>,
    context: Option<&str>,
    limit: usize,
) -> Vec<MemoryNote> {
    let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
        return list_notes(snapshot, kind, context, limit);
    };
    let limit = if limit == 0 { DEFAULT_NOTES_LIMIT } else { limit };
    let context = context.map(str::trim);
    search_notes(snapshot, query, usize::MAX)
        .into_iter()
        .map(|hit| hit.note)
        .filter(|n| kind.is_none_or(|k| n.kind == k))
        .filter(|n| context.is_none_or(|c| n.context == c))
        .take(limit)
        .collect()
}

// =============================================================================
// LIVE QUERIES
// =============================================================================

/// Query operations bound to a store and an artifact probe.
pub struct MemoryQuery<'a> {
    store: &'a MemoryStore,
    probe: &'a dyn ArtifactProbe,
}

impl<'a> MemoryQuery<'a> {
    #[must_use]
    pub fn new(store: &'a MemoryStore, probe: &'a dyn ArtifactProbe) -> Self {
        Self { store, probe }
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolsmithError> {
        Ok(search(&self.store.snapshot()?, self.probe, query, limit))
    }

    pub fn show(&self, prefix: &str) -> Result<ToolDetails, ToolsmithError> {
        show(&self.store.snapshot()?, self.probe, prefix)
    }

    pub fn related(&self, prefix: &str, depth: usize) -> Result<Vec<RelatedEntry>, ToolsmithError> {
        related(&self.store.snapshot()?, self.probe, prefix, depth)
    }

    /// Resolve both endpoints, then store the edge.
    pub fn relate(
        &self,
        from: &str,
        to: &str,
        label: &str,
        note: &str,
    ) -> Result<RelationEdge, ToolsmithError> {
        let edge = prepare_edge(&self.store.snapshot()?, from, to, label, note, unix_now())?;
        self.store.add_edge(&edge)?;
        Ok(edge)
    }

    pub fn notes(
        &self,
        kind: Option<NoteKind>,
        context: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryNote>, ToolsmithError> {
        Ok(list_notes(&self.store.snapshot()?, kind, context, limit))
    }

    pub fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<NoteHit>, ToolsmithError> {
        Ok(search_notes(&self.store.snapshot()?, query, limit))
    }

    pub fn find_notes(
        &self,
        query: Option<&str>,
        kind: Option<NoteKind>,
        context: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryNote>, ToolsmithError> {
        Ok(find_notes(&self.store.snapshot()?, query, kind, context, limit))
    }

    pub fn show_note(&self, prefix: &str) -> Result<MemoryNote, ToolsmithError> {
        resolve_note_prefix(&self.store.snapshot()?, prefix).cloned()
    }

    /// Resolve a note prefix, then change its status.
    pub fn resolve_note(
        &self,
        prefix: &str,
        status: NoteStatus,
    ) -> Result<MemoryNote, ToolsmithError> {
        let hash = resolve_note_prefix(&self.store.snapshot()?, prefix)?.hash.clone();
        self.store.set_note_status(&hash, status)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::memory::{NoArtifacts, NoteUpdate, merge_note};
    use std::collections::BTreeSet;

    fn record(hash: &str, app: &str, goal: &str, tags: &[&str]) -> MemoryRecord {
        MemoryRecord {
            hash: ToolHash::new(hash),
            app: app.to_string(),
            goal: goal.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            io_signature: "num,num -> num".to_string(),
            pattern: "arg_num>arg_num>add>print_num".to_string(),
            capabilities: BTreeSet::new(),
            created: 0,
            last_used: 0,
            use_count: 1,
        }
    }

    fn snapshot() -> MemorySnapshot {
        let mut snap = MemorySnapshot::default();
        for r in [
            record("aa11", "sum", "add two numbers", &["math"]),
            record("aa22", "product", "multiply numbers", &["math", "mathematics"]),
            record("bb33", "greet", "say hello", &["text"]),
        ] {
            snap.records.insert(r.hash.clone(), r);
        }
        snap
    }

    #[test]
    fn search_ranks_by_score_then_hash() {
        let hits = search(&snapshot(), &NoArtifacts, "math", 0);
        let order: Vec<_> = hits.iter().map(|h| (h.summary.app.as_str(), h.score)).collect();
        // product: tag equal 3 + tag contains 1 + pattern/io no = 4; sum: 3
        assert_eq!(order, vec![("product", 4), ("sum", 3)]);
    }

    #[test]
    fn search_without_matches_is_empty() {
        assert!(search(&snapshot(), &NoArtifacts, "zebra", 5).is_empty());
        assert!(search(&snapshot(), &NoArtifacts, "   ", 5).is_empty());
    }

    #[test]
    fn prefix_resolution() {
        let snap = snapshot();
        assert_eq!(resolve_prefix(&snap, "bb").unwrap().app, "greet");
        assert_eq!(resolve_prefix(&snap, "AA1").unwrap().app, "sum");

        let err = resolve_prefix(&snap, "aa").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousHashPrefix);
        assert_eq!(err.fields().get("candidates").unwrap(), "aa11,aa22");

        assert_eq!(resolve_prefix(&snap, "cc").unwrap_err().kind(), ErrorKind::RecordNotFound);
        assert_eq!(resolve_prefix(&snap, "").unwrap_err().kind(), ErrorKind::RecordNotFound);
    }

    #[test]
    fn prepare_edge_requires_both_endpoints() {
        let snap = snapshot();
        let edge = prepare_edge(&snap, "aa1", "bb", "variant_of", " same io ", 7).unwrap();
        assert_eq!(edge.to.as_str(), "bb33");
        assert_eq!(edge.note, "same io");
        let err = prepare_edge(&snap, "aa1", "zz", "variant_of", "", 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecordNotFound);
        assert!(prepare_edge(&snap, "aa1", "bb", "", "", 7).is_err());
        assert!(prepare_edge(&snap, "aa1", "bb", &"x".repeat(65), "", 7).is_err());
    }

    #[test]
    fn related_reports_missing_neighbor_records() {
        let mut snap = snapshot();
        snap.edges.push(RelationEdge {
            from: ToolHash::new("aa11"),
            to: ToolHash::new("ffff"),
            label: "pipes_to".to_string(),
            created: 0,
            note: String::new(),
        });
        let entries = related(&snap, &NoArtifacts, "aa1", 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].neighbor_hash.as_str(), "ffff");
        assert!(entries[0].neighbor.is_none());
    }

    #[test]
    fn show_without_cache_has_no_manifest() {
        let details = show(&snapshot(), &NoArtifacts, "bb").unwrap();
        assert_eq!(details.record.app, "greet");
        assert!(!details.binary_exists);
        assert!(details.manifest.is_none());
    }

    fn note(kind: NoteKind, summary: &str, context: &str, created: u64) -> MemoryNote {
        let update = NoteUpdate::new(kind, summary, "", context, ["build"]).unwrap();
        merge_note(None, &update, created)
    }

    fn with_notes() -> MemorySnapshot {
        let mut snap = snapshot();
        for n in [
            note(NoteKind::Issue, "linker fails on musl", "ci", 30),
            note(NoteKind::Decision, "cache binaries by hash", "cache", 10),
            note(NoteKind::Issue, "slow cold builds", "cache", 20),
        ] {
            snap.notes.insert(n.hash.clone(), n);
        }
        snap
    }

    #[test]
    fn notes_list_newest_first_with_filters() {
        let snap = with_notes();
        let all: Vec<_> = list_notes(&snap, None, None, 0).into_iter().map(|n| n.created).collect();
        assert_eq!(all, vec![30, 20, 10]);

        let issues = list_notes(&snap, Some(NoteKind::Issue), Some("cache"), 0);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].summary, "slow cold builds");

        assert_eq!(list_notes(&snap, None, None, 1).len(), 1);
    }

    #[test]
    fn find_notes_ranks_then_filters() {
        let snap = with_notes();
        let summaries = |notes: Vec<MemoryNote>| -> Vec<String> {
            notes.into_iter().map(|n| n.summary).collect()
        };
        assert_eq!(
            summaries(find_notes(&snap, Some("cache"), None, None, 0)),
            vec!["cache binaries by hash", "slow cold builds"]
        );
        assert_eq!(
            summaries(find_notes(&snap, Some("cache"), Some(NoteKind::Issue), None, 0)),
            vec!["slow cold builds"]
        );
        assert_eq!(
            summaries(find_notes(&snap, Some("cache"), None, Some("ci"), 0)),
            Vec::<String>::new()
        );
        // a blank query lists newest first
        assert_eq!(find_notes(&snap, Some("  "), None, None, 2).len(), 2);
        assert_eq!(
            find_notes(&snap, None, None, None, 0)[0].summary,
            "linker fails on musl"
        );
    }

    #[test]
    fn note_search_and_prefix() {
        let snap = with_notes();
        let hits = search_notes(&snap, "cache", 0);
        // summary 3 + context 2 beats context 2
        assert_eq!(hits[0].note.summary, "cache binaries by hash");
        assert_eq!((hits[0].score, hits[1].score), (5, 2));

        let target = &hits[0].note.hash;
        let found = resolve_note_prefix(&snap, &target[..10]).unwrap();
        assert_eq!(&found.hash, target);
        assert_eq!(
            resolve_note_prefix(&snap, "zz").unwrap_err().kind(),
            ErrorKind::RecordNotFound
        );
    }
}
