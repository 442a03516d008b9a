//! # Memory Store Tests
//!
//! Recording, querying and relating tools through a full session, plus the
//! local-first behavior of the mirror.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use toolsmith_core::{
    Backend, CompileRequest, ErrorKind, FlatFileMemory, MemoryNote, MemoryRecord, MemoryStore,
    Mirror, NoArtifacts, NoteKind, NoteStatus, NoteUpdate, Program, RelationEdge, Session,
    ToolsmithError,
};

struct CopyBackend;

impl Backend for CopyBackend {
    fn name(&self) -> &str {
        "copy"
    }

    fn compile(&self, program: &Program, out: &Path) -> Result<(), ToolsmithError> {
        std::fs::write(out, program.source.as_bytes()).map_err(ToolsmithError::storage)
    }
}

fn manifest(app: &str, value: i64) -> String {
    format!(
        r#"{{
            "app": "{app}",
            "capabilities": ["io_write"],
            "nodes": [
                {{"id": "x", "use": "arg_num", "params": {{"index": 1}}}},
                {{"id": "k", "use": "const_num", "params": {{"value": {value}}}}},
                {{"id": "s", "use": "add", "bind": {{"lhs": "x", "rhs": "k"}}}},
                {{"id": "out", "use": "print_num", "bind": {{"value": "s"}}}}
            ]
        }}"#
    )
}

fn annotated(goal: &str, tags: &[&str]) -> CompileRequest {
    CompileRequest {
        goal: Some(goal.to_string()),
        tags: tags.iter().map(|t| (*t).to_string()).collect(),
        store: true,
    }
}

/// Mirror that records calls and optionally fails.
#[derive(Clone, Default)]
struct TestMirror {
    records: Arc<Mutex<Vec<MemoryRecord>>>,
    edges: Arc<Mutex<Vec<RelationEdge>>>,
    notes: Arc<Mutex<Vec<MemoryNote>>>,
    fail: bool,
}

impl Mirror for TestMirror {
    fn name(&self) -> &str {
        "test"
    }

    fn publish_record(&self, record: &MemoryRecord) -> Result<(), ToolsmithError> {
        if self.fail {
            return Err(ToolsmithError::Mirror("connection refused".to_string()));
        }
        self.records.lock().expect("lock").push(record.clone());
        Ok(())
    }

    fn publish_edge(&self, edge: &RelationEdge) -> Result<(), ToolsmithError> {
        if self.fail {
            return Err(ToolsmithError::Mirror("connection refused".to_string()));
        }
        self.edges.lock().expect("lock").push(edge.clone());
        Ok(())
    }

    fn publish_note(&self, note: &MemoryNote) -> Result<(), ToolsmithError> {
        if self.fail {
            return Err(ToolsmithError::Mirror("connection refused".to_string()));
        }
        self.notes.lock().expect("lock").push(note.clone());
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), ToolsmithError> {
        Ok(())
    }
}

fn session_with(home: &Path, mirror: Option<TestMirror>) -> Session {
    let session = Session::open_home(home, None, CopyBackend).expect("session");
    let memory = MemoryStore::new(FlatFileMemory::open(home.join("memory.json")).expect("memory"));
    let memory = match mirror {
        Some(m) => memory.with_mirror(m),
        None => memory,
    };
    session.with_memory(memory)
}

#[test]
fn search_recall_by_goal_and_tag() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let sum = session
        .compile(&manifest("adder", 1), &annotated("add two numbers", &["math"]))
        .expect("compile");
    session
        .compile(&manifest("other", 2), &annotated("print something", &["misc"]))
        .expect("compile");

    for query in ["add", "math"] {
        let hits = session.query().search(query, 0).expect("search");
        assert!(hits.iter().any(|h| h.summary.hash == sum.hash), "query {query}");
        assert!(hits[0].summary.binary_exists);
    }
}

#[test]
fn show_returns_stored_manifest() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let source = manifest("adder", 5);
    let outcome = session
        .compile(&source, &annotated("add five", &[]))
        .expect("compile");

    let details = session.query().show(&outcome.hash.as_str()[..8]).expect("show");
    assert_eq!(details.record.hash, outcome.hash);
    let stored = details.manifest.expect("manifest");
    let original: serde_json::Value = serde_json::from_str(&source).expect("json");
    assert_eq!(stored, original);
    // integers keep their spelling instead of coming back as 5.0
    assert_eq!(stored["nodes"][1]["params"]["value"].to_string(), "5");

    let meta = session.cache().info(&outcome.hash.as_str()[..8]).expect("info");
    assert_eq!(meta.manifest, source);
}

#[test]
fn show_reports_missing_binary_after_forget() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let outcome = session
        .compile(&manifest("adder", 5), &annotated("add five", &[]))
        .expect("compile");
    session.cache().forget("adder").expect("forget");

    let details = session.query().show(outcome.hash.as_str()).expect("show");
    assert!(!details.binary_exists);
    assert!(details.manifest.is_none());
}

#[test]
fn relate_unknown_hashes_leaves_graph_unchanged() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let known = session
        .compile(&manifest("adder", 1), &annotated("add one", &[]))
        .expect("compile");

    let err = session
        .query()
        .relate(&"0".repeat(64), &"1".repeat(64), "variant_of", "")
        .expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::RecordNotFound);

    let err = session
        .query()
        .relate(known.hash.as_str(), &"1".repeat(64), "variant_of", "")
        .expect_err("one unknown");
    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    assert!(session.memory().snapshot().expect("snapshot").edges.is_empty());
}

#[test]
fn related_traverses_relations() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let hashes: Vec<_> = (1..=3)
        .map(|i| {
            session
                .compile(&manifest(&format!("step-{i}"), i), &annotated("chain", &[]))
                .expect("compile")
                .hash
        })
        .collect();
    let q = session.query();
    q.relate(hashes[0].as_str(), hashes[1].as_str(), "pipes_to", "").expect("relate");
    q.relate(hashes[1].as_str(), hashes[2].as_str(), "pipes_to", "").expect("relate");
    // cycles are allowed
    q.relate(hashes[2].as_str(), hashes[0].as_str(), "supersedes", "").expect("relate");

    let direct = q.related(hashes[1].as_str(), 1).expect("related");
    assert_eq!(direct.len(), 2);
    assert!(direct.iter().all(|e| e.neighbor.is_some() && e.depth == 1));
}

#[test]
fn ambiguous_prefix_names_all_candidates() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let mut hashes = Vec::new();
    for i in 0..40 {
        let outcome = session
            .compile(&manifest("many", i), &annotated("many", &[]))
            .expect("compile");
        hashes.push(outcome.hash.to_string());
    }
    hashes.sort();

    // 40 hashes over 16 leading digits: some digit is shared
    let digit = hashes
        .windows(2)
        .find(|w| w[0][..1] == w[1][..1])
        .map(|w| w[0][..1].to_string())
        .expect("shared digit");
    let expected: Vec<String> = hashes
        .iter()
        .filter(|h| h.starts_with(digit.as_str()))
        .cloned()
        .collect();

    match session.query().show(&digit) {
        Err(ToolsmithError::AmbiguousHashPrefix { candidates, .. }) => {
            assert_eq!(candidates, expected);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn mirror_failure_does_not_fail_the_caller() {
    let dir = tempdir().expect("temp dir");
    let mirror = TestMirror {
        fail: true,
        ..TestMirror::default()
    };
    let session = session_with(dir.path(), Some(mirror));
    let outcome = session
        .compile(&manifest("adder", 1), &annotated("add one", &["math"]))
        .expect("compile despite mirror failure");
    assert!(session.memory().get(&outcome.hash).expect("get").is_some());
    assert_eq!(session.memory().mirror_failures(), 1);
}

#[test]
fn mirror_receives_writes_and_sync() {
    let dir = tempdir().expect("temp dir");
    let mirror = TestMirror::default();
    let session = session_with(dir.path(), Some(mirror.clone()));
    let a = session
        .compile(&manifest("first", 1), &annotated("first", &[]))
        .expect("compile");
    let b = session
        .compile(&manifest("second", 2), &annotated("second", &[]))
        .expect("compile");
    session
        .query()
        .relate(a.hash.as_str(), b.hash.as_str(), "variant_of", "")
        .expect("relate");
    let note = NoteUpdate::new(NoteKind::Pattern, "adders differ by constant", "", "", [""])
        .expect("note");
    session.memory().note(&note).expect("note");
    assert_eq!(mirror.records.lock().expect("lock").len(), 2);
    assert_eq!(mirror.edges.lock().expect("lock").len(), 1);
    assert_eq!(mirror.notes.lock().expect("lock").len(), 1);

    let report = session.memory().sync().expect("sync");
    assert_eq!(
        (report.records, report.edges, report.notes, report.failed),
        (2, 1, 1, 0)
    );
    assert_eq!(mirror.records.lock().expect("lock").len(), 4);
}

#[test]
fn notes_record_list_and_resolve() {
    let dir = tempdir().expect("temp dir");
    let mirror = TestMirror::default();
    let session = session_with(dir.path(), Some(mirror.clone()));
    let q = session.query();

    let first = NoteUpdate::new(
        NoteKind::Issue,
        "rustc missing on ci runners",
        "",
        "ci",
        ["backend"],
    )
    .expect("note");
    let recorded = session.memory().note(&first).expect("note");
    let detailed = NoteUpdate {
        detail: "install the stable toolchain".to_string(),
        ..first.clone()
    };
    let merged = session.memory().note(&detailed).expect("note");
    assert_eq!(merged.hash, recorded.hash);
    assert_eq!(merged.detail, "install the stable toolchain");
    assert_eq!(merged.status, NoteStatus::Active);

    let other = NoteUpdate::new(NoteKind::Decision, "record every build", "", "memory", [""])
        .expect("note");
    session.memory().note(&other).expect("note");

    let issues = q.notes(Some(NoteKind::Issue), None, 0).expect("notes");
    assert_eq!(issues.len(), 1);
    assert_eq!(q.notes(None, Some("memory"), 0).expect("notes").len(), 1);
    assert_eq!(q.search_notes("toolchain", 5).expect("search")[0].note.hash, recorded.hash);

    let resolved = q
        .resolve_note(&recorded.hash[..8], NoteStatus::Resolved)
        .expect("resolve");
    assert_eq!(resolved.status, NoteStatus::Resolved);
    assert_eq!(q.show_note(&recorded.hash[..8]).expect("show").status, NoteStatus::Resolved);
    assert_eq!(
        q.resolve_note("ffffffff", NoteStatus::Resolved)
            .expect_err("unknown")
            .kind(),
        ErrorKind::RecordNotFound
    );
    // record, merge, second note, status change
    assert_eq!(mirror.notes.lock().expect("lock").len(), 4);
}

#[test]
fn relation_note_is_kept_on_the_edge() {
    let dir = tempdir().expect("temp dir");
    let session = session_with(dir.path(), None);
    let a = session
        .compile(&manifest("first", 1), &annotated("first", &[]))
        .expect("compile");
    let b = session
        .compile(&manifest("second", 2), &annotated("second", &[]))
        .expect("compile");
    let edge = session
        .query()
        .relate(a.hash.as_str(), b.hash.as_str(), "variant_of", "adds 2 instead of 1")
        .expect("relate");
    assert_eq!(edge.note, "adds 2 instead of 1");

    let related = session.query().related(a.hash.as_str(), 1).expect("related");
    assert_eq!(related[0].note, "adds 2 instead of 1");
}

#[test]
fn sync_without_mirror_is_an_error() {
    let dir = tempdir().expect("temp dir");
    let store = MemoryStore::open_flat_file(dir.path().join("memory.json")).expect("memory");
    assert!(store.sync().is_err());
    assert!(store.log(5).expect("log").is_empty());
    let q = toolsmith_core::MemoryQuery::new(&store, &NoArtifacts);
    assert_eq!(q.show("ab").expect_err("empty").kind(), ErrorKind::RecordNotFound);
}
