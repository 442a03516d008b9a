//! # CLI Command Implementations
//!
//! Every command prints either human-readable text or, with `--machine`,
//! one JSON document on stdout.

use crate::api::{self, AppState};
use crate::config::Config;
use crate::remote::HttpMirror;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolsmith_core::{
    ArtifactMeta, Catalog, CompileOutcome, ErrorKind, MemoryNote, MemoryRecord, MemoryStore,
    NoteKind, NoteStatus, NoteUpdate, Session, ToolHash, ToolsmithError, gbnf, read_trailer,
};

use super::{MemoryAction, ToolsAction};

// =============================================================================
// INPUT LIMITS
// =============================================================================

/// Maximum manifest size (4 MB). Real manifests are a few kilobytes.
const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;

/// Read a manifest from a file, or from stdin when `path` is "-".
pub fn read_manifest(path: &Path) -> Result<String, ToolsmithError> {
    let text = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())
            .map_err(|e| ToolsmithError::Storage(format!("cannot read stdin: {e}")))?
    } else {
        let metadata = std::fs::metadata(path).map_err(|e| {
            ToolsmithError::Storage(format!("cannot read {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(ToolsmithError::Storage(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        check_size(metadata.len())?;
        std::fs::read_to_string(path).map_err(|e| {
            ToolsmithError::Storage(format!("cannot read {}: {e}", path.display()))
        })?
    };
    check_size(text.len() as u64)?;
    Ok(text)
}

fn check_size(len: u64) -> Result<(), ToolsmithError> {
    if len > MAX_MANIFEST_BYTES {
        return Err(ToolsmithError::Parse {
            detail: format!("manifest is {len} bytes, the limit is {MAX_MANIFEST_BYTES}"),
        });
    }
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Human or machine output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    machine: bool,
}

impl Output {
    pub fn new(machine: bool) -> Self {
        Self { machine }
    }

    pub fn is_machine(self) -> bool {
        self.machine
    }

    /// In machine mode print `{"status": "ok", ...value}`, otherwise run `human`.
    pub fn emit<T: Serialize>(self, value: &T, human: impl FnOnce()) -> Result<(), ToolsmithError> {
        if !self.machine {
            human();
            return Ok(());
        }
        println!("{}", ok_document(value)?);
        Ok(())
    }
}

/// The success document for `value`. Objects are merged, anything else
/// lands under `result`.
pub fn ok_document<T: Serialize>(value: &T) -> Result<String, ToolsmithError> {
    let mut doc = Map::new();
    doc.insert("status".to_string(), Value::from("ok"));
    match serde_json::to_value(value).map_err(ToolsmithError::storage)? {
        Value::Object(fields) => doc.extend(fields),
        other => {
            doc.insert("result".to_string(), other);
        }
    }
    serde_json::to_string_pretty(&Value::Object(doc)).map_err(ToolsmithError::storage)
}

// =============================================================================
// SESSION SETUP
// =============================================================================

/// Open the session under the configured home, with a mirror when a
/// remote url is configured.
pub fn open_session(config: &Config, handle: tokio::runtime::Handle) -> Result<Session, ToolsmithError> {
    let home = config.home();
    let session = Session::open_home(&home, Some(config.lock_timeout()), config.rustc_backend())?;
    let Some(url) = config.remote_url() else {
        return Ok(session);
    };
    let mirror = HttpMirror::new(
        url,
        config.remote.api_key.clone(),
        config.remote_timeout(),
        handle,
    )?;
    tracing::debug!(url = mirror.base_url(), "mirroring memory writes");
    let memory = MemoryStore::open_flat_file(home.join("memory.json"))?.with_mirror(mirror);
    Ok(session.with_memory(memory))
}

/// Run `f` against a fresh session on the blocking pool, then wait for
/// mirror writes.
pub async fn with_session<F>(config: Config, f: F) -> Result<(), ToolsmithError>
where
    F: FnOnce(&Session) -> Result<(), ToolsmithError> + Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let session = open_session(&config, handle)?;
        let result = f(&session);
        session.memory().flush(config.remote_timeout());
        let failures = session.memory().mirror_failures();
        if failures > 0 {
            tracing::warn!(
                failures,
                "some memory writes did not reach the remote; run `toolsmith memory sync` later"
            );
        }
        result
    })
    .await
    .map_err(|e| ToolsmithError::Storage(format!("command task failed: {e}")))?
}

// =============================================================================
// COMPOSE / CHECK / EXPAND
// =============================================================================

/// `compose` result: the outcome plus where the binary was copied.
#[derive(Serialize)]
struct Composed<'a> {
    #[serde(flatten)]
    outcome: &'a CompileOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a Path>,
}

/// Compile a manifest (or reuse its cached binary) and record it. With
/// `output`, the binary is also copied there.
pub fn cmd_compose(
    session: &Session,
    manifest: &Path,
    goal: Option<String>,
    tags: Vec<String>,
    record: bool,
    output: Option<&Path>,
    out: Output,
) -> Result<(), ToolsmithError> {
    let source = read_manifest(manifest)?;
    let request = toolsmith_core::CompileRequest {
        goal,
        tags,
        store: record,
    };
    let outcome = session.compile(&source, &request)?;
    if let Some(dest) = output {
        session.cache().export(&outcome.hash, dest)?;
    }

    let composed = Composed {
        outcome: &outcome,
        output,
    };
    out.emit(&composed, || {
        let verb = if outcome.cached { "cached" } else { "compiled" };
        println!("{verb} {} ({})", outcome.app, outcome.hash.short());
        println!("  binary: {}", outcome.binary.display());
        if let Some(dest) = output {
            println!("  copied: {}", dest.display());
        }
        for port in &outcome.inputs {
            println!("  in:  {} {} ({})", port.channel, port.ty, port.node);
        }
        for port in &outcome.outputs {
            println!("  out: {} {} ({})", port.channel, port.ty, port.node);
        }
    })
}

/// Validate a manifest and describe it.
pub fn cmd_check(session: &Session, manifest: &Path, out: Output) -> Result<(), ToolsmithError> {
    let source = read_manifest(manifest)?;
    let report = session.check(&source)?;

    out.emit(&report, || {
        println!("{} is valid", report.app);
        println!("  hash:         {}", report.hash);
        println!("  io:           {}", report.io_signature);
        println!("  pattern:      {}", report.pattern);
        println!("  capabilities: {}", join(report.capabilities.iter()));
        println!("  required:     {}", join(report.required_capabilities.iter()));
        println!(
            "  build cache:  {}",
            if report.cached { "hit" } else { "miss" }
        );
    })
}

/// Print the generated program.
pub fn cmd_expand(session: &Session, manifest: &Path, out: Output) -> Result<(), ToolsmithError> {
    let source = read_manifest(manifest)?;
    let program = session.expand(&source)?;

    #[derive(Serialize)]
    struct Expanded<'a> {
        app: &'a str,
        source: &'a str,
    }
    out.emit(
        &Expanded {
            app: &program.app,
            source: &program.source,
        },
        || print!("{}", program.source),
    )
}

// =============================================================================
// PRIMITIVES / INSPECT
// =============================================================================

/// List the primitive catalog.
pub fn cmd_primitives(out: Output) -> Result<(), ToolsmithError> {
    let catalog = Catalog::builtin();

    #[derive(Serialize)]
    struct Listing {
        catalog_version: u32,
        primitives: Vec<&'static toolsmith_core::PrimitiveSignature>,
    }
    let listing = Listing {
        catalog_version: catalog.version(),
        primitives: catalog.iter().collect(),
    };

    out.emit(&listing, || {
        println!("Primitive catalog v{} ({} primitives)", listing.catalog_version, catalog.len());
        for sig in &listing.primitives {
            let effects = if sig.effects.is_empty() {
                String::new()
            } else {
                format!("  [{}]", join(sig.effects.iter()))
            };
            println!(
                "  {:<14} ({}) -> {}{effects}",
                sig.name,
                sig.describe_slots(),
                sig.provides
            );
            println!("  {:<14} {}", "", sig.summary);
        }
    })
}

/// Print the manifest grammar.
pub fn cmd_grammar(out: Output) -> Result<(), ToolsmithError> {
    let catalog = Catalog::builtin();
    let grammar = gbnf(&catalog);
    out.emit(
        &serde_json::json!({
            "catalog_version": catalog.version(),
            "grammar": grammar,
        }),
        || print!("{grammar}"),
    )
}

/// Show the metadata trailer of a compiled tool.
pub fn cmd_inspect(binary: &Path, out: Output) -> Result<(), ToolsmithError> {
    let payload = read_trailer(binary)?.ok_or_else(|| ToolsmithError::Parse {
        detail: format!("{} has no toolsmith metadata trailer", binary.display()),
    })?;

    out.emit(&payload, || {
        println!("{} ({})", payload.app, payload.hash);
        println!("  capabilities: {}", join(payload.capabilities.iter()));
        for port in &payload.inputs {
            println!("  in:  {} {}", port.channel, port.ty);
        }
        for port in &payload.outputs {
            println!("  out: {} {}", port.channel, port.ty);
        }
        println!("  canonical: {}", payload.canonical);
    })
}

// =============================================================================
// TOOLS (BUILD CACHE)
// =============================================================================

/// One line of `tools list`.
#[derive(Debug, Serialize)]
struct ToolEntry {
    hash: ToolHash,
    app: String,
    size: u64,
    created: u64,
    binary: PathBuf,
}

impl ToolEntry {
    fn new(session: &Session, meta: &ArtifactMeta) -> Self {
        Self {
            hash: meta.hash.clone(),
            app: meta.app.clone(),
            size: meta.size,
            created: meta.created,
            binary: session.cache().binary_path(&meta.hash),
        }
    }
}

pub fn cmd_tools(session: &Session, action: ToolsAction, out: Output) -> Result<(), ToolsmithError> {
    let cache = session.cache();
    match action {
        ToolsAction::List => {
            let tools: Vec<ToolEntry> = cache
                .list()?
                .iter()
                .map(|meta| ToolEntry::new(session, meta))
                .collect();
            out.emit(&serde_json::json!({ "tools": tools }), || {
                if tools.is_empty() {
                    println!("No cached tools");
                }
                for tool in &tools {
                    println!(
                        "  {}  {:<24} {:>10} bytes",
                        tool.hash.short(),
                        tool.app,
                        tool.size
                    );
                }
            })
        }
        ToolsAction::Info { key } => {
            let meta = cache.info(&key)?;
            let entry = ToolEntry::new(session, &meta);
            out.emit(&meta, || {
                println!("{} ({})", meta.app, meta.hash);
                println!("  binary:       {}", entry.binary.display());
                println!("  size:         {} bytes", meta.size);
                println!("  created:      {}", meta.created);
                println!("  io:           {}", meta.io.signature());
                println!("  capabilities: {}", join(meta.capabilities.iter()));
                println!("{}", meta.manifest);
            })
        }
        ToolsAction::Forget { key } => {
            let removed = cache.forget(&key)?;
            out.emit(&serde_json::json!({ "removed": removed }), || {
                for hash in &removed {
                    println!("removed {}", hash.short());
                }
            })
        }
        ToolsAction::Clear => {
            let removed = cache.clear()?;
            out.emit(&serde_json::json!({ "removed": removed }), || {
                println!("removed {removed} cached tools");
            })
        }
    }
}

// =============================================================================
// MEMORY
// =============================================================================

fn print_record(record: &MemoryRecord) {
    println!("{} ({})", record.app, record.hash);
    if !record.goal.is_empty() {
        println!("  goal:         {}", record.goal);
    }
    if !record.tags.is_empty() {
        println!("  tags:         {}", join(record.tags.iter()));
    }
    println!("  io:           {}", record.io_signature);
    println!("  pattern:      {}", record.pattern);
    println!("  capabilities: {}", join(record.capabilities.iter()));
    println!("  uses:         {} (last {})", record.use_count, record.last_used);
}

fn print_note(note: &MemoryNote) {
    println!("[{}] {} ({})", note.kind, note.summary, short_note(&note.hash));
    if !note.detail.is_empty() {
        println!("  {}", note.detail);
    }
    if !note.context.is_empty() {
        println!("  context: {}", note.context);
    }
    if !note.tags.is_empty() {
        println!("  tags:    {}", join(note.tags.iter()));
    }
    println!("  status:  {} (created {})", note.status, note.created);
}

fn short_note(hash: &str) -> &str {
    toolsmith_core::memory::short_hash(hash)
}

pub fn cmd_memory(
    session: &Session,
    action: MemoryAction,
    flush_timeout: Duration,
    out: Output,
) -> Result<(), ToolsmithError> {
    let query = session.query();
    match action {
        MemoryAction::Search { query: words, limit } => {
            let hits = query.search(&words.join(" "), limit)?;
            out.emit(&serde_json::json!({ "hits": hits }), || {
                if hits.is_empty() {
                    println!("No matching tools");
                }
                for hit in &hits {
                    let missing = if hit.summary.binary_exists { "" } else { "  (not cached)" };
                    println!(
                        "  {:>3}  {}  {:<20} {}{missing}",
                        hit.score, hit.summary.short, hit.summary.app, hit.summary.goal
                    );
                    println!("       {}  [{}]", hit.summary.io_signature, hit.summary.tags.join(", "));
                }
            })
        }
        MemoryAction::Show { prefix } => {
            // notes share the prefix namespace; a tool wins when both match
            let details = match query.show(&prefix) {
                Err(e) if e.kind() == ErrorKind::RecordNotFound => {
                    let note = query.show_note(&prefix).map_err(|note_err| {
                        if note_err.kind() == ErrorKind::RecordNotFound {
                            e
                        } else {
                            note_err
                        }
                    })?;
                    return out.emit(&note, || print_note(&note));
                }
                other => other?,
            };
            out.emit(&details, || {
                print_record(&details.record);
                println!(
                    "  binary:       {}",
                    if details.binary_exists { "cached" } else { "not cached" }
                );
                if let Some(manifest) = &details.manifest {
                    println!("{}", serde_json::to_string_pretty(manifest).unwrap_or_default());
                }
            })
        }
        MemoryAction::Related { prefix, depth } => {
            let related = query.related(&prefix, depth)?;
            out.emit(&serde_json::json!({ "related": related }), || {
                if related.is_empty() {
                    println!("No related tools");
                }
                for entry in &related {
                    let app = entry.neighbor.as_ref().map_or("?", |n| n.app.as_str());
                    println!(
                        "  {}  {} -{}-> {}  {app}",
                        entry.depth,
                        entry.from.short(),
                        entry.label,
                        entry.to.short()
                    );
                    if !entry.note.is_empty() {
                        println!("     {}", entry.note);
                    }
                }
            })
        }
        MemoryAction::Relate {
            from,
            to,
            label,
            note,
        } => {
            let edge = query.relate(&from, &to, &label, &note)?;
            out.emit(&edge, || {
                println!("{} -{}-> {}", edge.from.short(), edge.label, edge.to.short());
                if !edge.note.is_empty() {
                    println!("  {}", edge.note);
                }
            })
        }
        MemoryAction::Note {
            summary,
            detail,
            kind,
            context,
            tags,
        } => {
            let update = NoteUpdate::new(kind.parse()?, &summary, &detail, &context, &tags)?;
            let note = session.memory().note(&update)?;
            out.emit(&note, || print_note(&note))
        }
        MemoryAction::Notes {
            kind,
            context,
            query: words,
            limit,
        } => {
            let kind = kind.as_deref().map(str::parse::<NoteKind>).transpose()?;
            let notes = query.find_notes(words.as_deref(), kind, context.as_deref(), limit)?;
            out.emit(&serde_json::json!({ "notes": notes }), || {
                if notes.is_empty() {
                    println!("No notes");
                }
                for note in &notes {
                    let status = match note.status {
                        NoteStatus::Active => String::new(),
                        other => format!("  ({other})"),
                    };
                    println!(
                        "  {}  {:<9} {}{status}",
                        short_note(&note.hash),
                        note.kind,
                        note.summary
                    );
                }
            })
        }
        MemoryAction::Resolve { hash, status } => {
            let note = query.resolve_note(&hash, status.parse()?)?;
            out.emit(&note, || print_note(&note))
        }
        MemoryAction::Record { key, goal, tags } => {
            let record = session.annotate(&key, goal.as_deref(), &tags)?;
            out.emit(&record, || print_record(&record))
        }
        MemoryAction::Log { limit } => {
            let records = session.memory().log(limit)?;
            out.emit(&serde_json::json!({ "records": records }), || {
                for r in &records {
                    println!(
                        "  {}  {:<20} uses {:<4} last {}  {}",
                        r.hash.short(),
                        r.app,
                        r.use_count,
                        r.last_used,
                        r.goal
                    );
                }
            })
        }
        MemoryAction::Sync => {
            let memory = session.memory();
            let report = memory.sync()?;
            memory.flush(flush_timeout);
            let undelivered = memory.mirror_failures();
            out.emit(
                &serde_json::json!({
                    "records": report.records,
                    "edges": report.edges,
                    "notes": report.notes,
                    "failed": report.failed,
                    "undelivered": undelivered,
                }),
                || {
                    println!(
                        "queued {} records, {} relations and {} notes, {} not delivered",
                        report.records, report.edges, report.notes, undelivered
                    );
                },
            )
        }
    }
}

// =============================================================================
// SERVE
// =============================================================================

/// Run the memory server until interrupted.
pub async fn cmd_serve(host: &str, port: u16, db: &Path, out: Output) -> Result<(), ToolsmithError> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(ToolsmithError::storage)?;
    }
    let state = AppState::open(db)?;
    let addr = format!("{host}:{port}");

    if !out.is_machine() {
        println!("toolsmith memory server");
        println!("  listen:   {addr}");
        println!("  database: {}", db.display());
        println!("  auth:     {}", api::AccessKeys::from_env().describe());
        println!();
        println!("Press Ctrl+C to stop");
    }
    api::run_server(&addr, state).await
}

fn join<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let parts: Vec<String> = items.map(|i| i.to_string()).collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

// =============================================================================
// TESTS
// =============================================================================
