//! # API Endpoint Handlers
//!
//! This module implements the memory server's HTTP endpoint handlers.
//! The server has no build cache, so every response reports
//! `binary_exists: false` and no manifest.
//!
//! Replicated notes are content-addressed like tools: the stored hash must
//! match the note's kind and summary.

use super::{
    AppState,
    types::{
        ApiError, HealthResponse, NoteResponse, NotesParams, NotesResponse, RelatedParams,
        RelatedResponse, SearchParams, SearchResponse, ShowResponse, WriteResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use toolsmith_core::{
    MemoryNote, MemoryRecord, NoArtifacts, NoteKind, RelationEdge, ToolHash, ToolsmithError,
    memory::note_hash,
    primitives::{DEFAULT_NOTES_LIMIT, DEFAULT_RELATED_DEPTH, DEFAULT_SEARCH_LIMIT, MAX_RELATED_DEPTH},
    query,
};

/// Largest page a single search may request.
pub const MAX_SEARCH_LIMIT: usize = 100;

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// READ HANDLERS
// =============================================================================

/// Keyword search over stored records.
pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let limit = params
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    let snapshot = state.memory.snapshot()?;
    let hits = query::search(
        &snapshot,
        &NoArtifacts,
        params.q.as_deref().unwrap_or_default(),
        limit,
    );
    Ok(Json(SearchResponse::new(hits)))
}

/// One record by hash prefix.
pub async fn show_handler(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<Json<ShowResponse>, ApiError> {
    let snapshot = state.memory.snapshot()?;
    let details = query::show(&snapshot, &NoArtifacts, &prefix)?;
    Ok(Json(ShowResponse::new(details)))
}

/// Neighbors of a record in the relation graph. Depth is clamped.
pub async fn related_handler(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
    Query(params): Query<RelatedParams>,
) -> Result<Json<RelatedResponse>, ApiError> {
    let depth = params
        .depth
        .filter(|&d| d > 0)
        .unwrap_or(DEFAULT_RELATED_DEPTH)
        .min(MAX_RELATED_DEPTH);
    let snapshot = state.memory.snapshot()?;
    let related = query::related(&snapshot, &NoArtifacts, &prefix, depth)?;
    Ok(Json(RelatedResponse::new(depth, related)))
}

// =============================================================================
// WRITE HANDLERS
// =============================================================================

/// Store a replicated record. The path hash must match the body.
pub async fn put_record_handler(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(record): Json<MemoryRecord>,
) -> Result<Json<WriteResponse>, ApiError> {
    if !ToolHash::is_well_formed(&hash) {
        return Err(ToolsmithError::Parse {
            detail: format!("\"{hash}\" is not a full tool hash"),
        }
        .into());
    }
    if record.hash.as_str() != hash {
        return Err(ToolsmithError::Parse {
            detail: format!("body hash {} does not match path hash {hash}", record.hash),
        }
        .into());
    }
    state.memory.put(&record)?;
    Ok(Json(WriteResponse::new(record.hash.to_string())))
}

/// Store a replicated edge. Both endpoints must already be stored under
/// their full hashes.
pub async fn add_edge_handler(
    State(state): State<AppState>,
    Json(edge): Json<RelationEdge>,
) -> Result<Json<WriteResponse>, ApiError> {
    let label = query::check_label(&edge.label)?.to_string();
    for endpoint in [&edge.from, &edge.to] {
        if state.memory.get(endpoint)?.is_none() {
            return Err(ToolsmithError::RecordNotFound {
                prefix: endpoint.to_string(),
            }
            .into());
        }
    }
    let edge = RelationEdge { label, ..edge };
    state.memory.add_edge(&edge)?;
    Ok(Json(WriteResponse::new(edge.from.to_string())))
}

/// Store a replicated note. The path hash must be the note's content hash.
pub async fn put_note_handler(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(note): Json<MemoryNote>,
) -> Result<Json<WriteResponse>, ApiError> {
    let expected = note_hash(note.kind, &note.summary);
    if hash != expected || note.hash != expected {
        return Err(ToolsmithError::Parse {
            detail: format!(
                "note hash {hash} does not match its kind and summary (expected {expected})"
            ),
        }
        .into());
    }
    state.memory.put_note(&note)?;
    Ok(Json(WriteResponse::new(note.hash)))
}

// =============================================================================
// NOTE READS
// =============================================================================

/// Notes, newest first or ranked by `q`.
pub async fn notes_handler(
    State(state): State<AppState>,
    Query(params): Query<NotesParams>,
) -> Result<Json<NotesResponse>, ApiError> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<NoteKind>)
        .transpose()?;
    let limit = params
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(DEFAULT_NOTES_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    let snapshot = state.memory.snapshot()?;
    let notes = query::find_notes(
        &snapshot,
        params.q.as_deref(),
        kind,
        params.context.as_deref(),
        limit,
    );
    Ok(Json(NotesResponse::new(notes)))
}

/// One note by hash prefix.
pub async fn show_note_handler(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<Json<NoteResponse>, ApiError> {
    let snapshot = state.memory.snapshot()?;
    let note = query::resolve_note_prefix(&snapshot, &prefix)?.clone();
    Ok(Json(NoteResponse::new(note)))
}
