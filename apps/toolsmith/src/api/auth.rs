//! # Access Control
//!
//! Two bearer keys guard the memory server, each granting a scope:
//!
//! - `TOOLSMITH_API_KEY`: the write key. Mirrors need it for `PUT` and
//!   `POST`; it also grants reads.
//! - `TOOLSMITH_READ_KEY`: optional read-only key for search, show,
//!   related and note listing.
//!
//! The scope of a request follows from its method: `GET`, `HEAD` and
//! `OPTIONS` read, everything else writes. `/health` is never guarded.
//!
//! | configured keys | reads             | writes                 |
//! |-----------------|-------------------|------------------------|
//! | none            | open              | open                   |
//! | write only      | write key         | write key              |
//! | read only       | read key          | refused (403)          |
//! | both            | read or write key | write key (read → 403) |
//!
//! Keys are read once when the router is built.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// What a request is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Read,
    Write,
}

impl Scope {
    #[must_use]
    pub fn for_method(method: &Method) -> Self {
        if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
            Scope::Read
        } else {
            Scope::Write
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    MissingKey,
    InvalidKey,
    /// A valid key without the write scope, or no write key configured.
    ReadOnly,
}

impl Denial {
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Denial::MissingKey | Denial::InvalidKey => StatusCode::UNAUTHORIZED,
            Denial::ReadOnly => StatusCode::FORBIDDEN,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Denial::MissingKey | Denial::InvalidKey => "Unauthorized",
            Denial::ReadOnly => "Forbidden: key does not grant writes",
        }
    }
}

/// The configured keys.
#[derive(Clone, Default)]
pub struct AccessKeys {
    write: Option<String>,
    read: Option<String>,
}

impl std::fmt::Debug for AccessKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

impl AccessKeys {
    /// Empty keys count as unset.
    #[must_use]
    pub fn new(write: Option<String>, read: Option<String>) -> Self {
        Self {
            write: write.filter(|k| !k.is_empty()),
            read: read.filter(|k| !k.is_empty()),
        }
    }

    /// `TOOLSMITH_API_KEY` and `TOOLSMITH_READ_KEY`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("TOOLSMITH_API_KEY").ok(),
            std::env::var("TOOLSMITH_READ_KEY").ok(),
        )
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.write.is_none() && self.read.is_none()
    }

    /// One-line summary for logs and the serve banner.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match (&self.write, &self.read) {
            (None, None) => "none",
            (Some(_), None) => "write key",
            (None, Some(_)) => "read key (writes refused)",
            (Some(_), Some(_)) => "read and write keys",
        }
    }

    /// Decide a request for `scope` presenting `presented`.
    pub fn check(&self, scope: Scope, presented: Option<&str>) -> Result<(), Denial> {
        if self.is_open() {
            return Ok(());
        }
        let Some(presented) = presented else {
            return Err(Denial::MissingKey);
        };
        let is_write = self.write.as_deref().is_some_and(|k| keys_match(presented, k));
        let is_read = self.read.as_deref().is_some_and(|k| keys_match(presented, k));
        match scope {
            Scope::Read if is_write || is_read => Ok(()),
            Scope::Write if is_write => Ok(()),
            Scope::Write if is_read || self.write.is_none() => Err(Denial::ReadOnly),
            _ => Err(Denial::InvalidKey),
        }
    }
}

/// Length-independent constant-time comparison.
fn keys_match(provided: &str, expected: &str) -> bool {
    let provided_bytes = provided.as_bytes();
    let expected_bytes = expected.as_bytes();

    let max_len = provided_bytes.len().max(expected_bytes.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided_bytes.len()].copy_from_slice(provided_bytes);
    padded_expected[..expected_bytes.len()].copy_from_slice(expected_bytes);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided_bytes.len() == expected_bytes.len()
}

/// Enforce [`AccessKeys`] on everything but `/health`.
pub async fn require_scope(
    State(keys): State<Arc<AccessKeys>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let scope = Scope::for_method(request.method());
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    match keys.check(scope, presented) {
        Ok(()) => Ok(next.run(request).await),
        Err(denial) => {
            tracing::warn!(
                event = "auth_failure",
                reason = ?denial,
                ?scope,
                method = %request.method(),
                path = %request.uri().path(),
                "request denied"
            );
            Err((denial.status(), denial.message()))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
