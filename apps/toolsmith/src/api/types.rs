//! # API Request/Response Types
//!
//! This module defines the JSON structures for the memory server API.
//! Errors use the shared [`ErrorResponse`] shape.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use toolsmith_core::{
    ErrorKind, ErrorResponse, MemoryNote, RelatedEntry, SearchHit, ToolDetails, ToolsmithError,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// QUERY PARAMETERS
// =============================================================================

/// `GET /records?q=&limit=`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /records/{prefix}/related?depth=`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatedParams {
    #[serde(default)]
    pub depth: Option<usize>,
}

/// `GET /notes?kind=&context=&q=&limit=`
///
/// With `q` the notes are ranked by keyword score and `kind`/`context`
/// narrow the ranked list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotesParams {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// =============================================================================
// RESPONSES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub status: String,
    pub hits: Vec<SearchHit>,
}

impl SearchResponse {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            status: "ok".to_string(),
            hits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowResponse {
    pub status: String,
    #[serde(flatten)]
    pub details: ToolDetails,
}

impl ShowResponse {
    pub fn new(details: ToolDetails) -> Self {
        Self {
            status: "ok".to_string(),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedResponse {
    pub status: String,
    pub depth: usize,
    pub related: Vec<RelatedEntry>,
}

impl RelatedResponse {
    pub fn new(depth: usize, related: Vec<RelatedEntry>) -> Self {
        Self {
            status: "ok".to_string(),
            depth,
            related,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesResponse {
    pub status: String,
    pub notes: Vec<MemoryNote>,
}

impl NotesResponse {
    pub fn new(notes: Vec<MemoryNote>) -> Self {
        Self {
            status: "ok".to_string(),
            notes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteResponse {
    pub status: String,
    pub note: MemoryNote,
}

impl NoteResponse {
    pub fn new(note: MemoryNote) -> Self {
        Self {
            status: "ok".to_string(),
            note,
        }
    }
}

/// Acknowledgement of a replicated write: the tool or note hash stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub status: String,
    pub hash: String,
}

impl WriteResponse {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            hash: hash.into(),
        }
    }
}

// =============================================================================
// ERROR RESPONSE
// =============================================================================

/// A core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ToolsmithError);

impl From<ToolsmithError> for ApiError {
    fn from(e: ToolsmithError) -> Self {
        Self(e)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::RecordNotFound => StatusCode::NOT_FOUND,
        ErrorKind::AmbiguousHashPrefix => StatusCode::CONFLICT,
        ErrorKind::ParseError
        | ErrorKind::DuplicateId
        | ErrorKind::AppNameInvalid
        | ErrorKind::UnknownPrimitive
        | ErrorKind::InvalidParam
        | ErrorKind::UndefinedReference
        | ErrorKind::TypeMismatch
        | ErrorKind::MissingCapability
        | ErrorKind::NoEffect => StatusCode::BAD_REQUEST,
        ErrorKind::BackendFailure
        | ErrorKind::HashCollisionSuspected
        | ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}
