//! # Rate Limiting
//!
//! Reads and writes draw from separate buckets, so a mirror replaying a
//! large store with `toolsmith memory sync` cannot starve searches, and a
//! busy reader cannot stall replication.
//!
//! ## Configuration
//!
//! - `TOOLSMITH_RATE_LIMIT`: read requests per second (default 100, 0 disables)
//! - `TOOLSMITH_WRITE_RATE_LIMIT`: write requests per second (default 500, 0 disables)
//!
//! The scope of a request is decided the same way as for authentication
//! (see [`Scope::for_method`]). A rejected request gets `429` with
//! `Retry-After: 1`; both buckets refill every second.

use super::auth::Scope;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;

pub const DEFAULT_READ_RPS: u32 = 100;
pub const DEFAULT_WRITE_RPS: u32 = 500;

/// One token bucket.
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-scope buckets. `None` means that scope is unlimited.
#[derive(Default)]
pub struct RateLimits {
    reads: Option<Limiter>,
    writes: Option<Limiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("reads", &self.reads.is_some())
            .field("writes", &self.writes.is_some())
            .finish()
    }
}

fn bucket(per_second: u32) -> Option<Limiter> {
    NonZeroU32::new(per_second).map(|rps| RateLimiter::direct(Quota::per_second(rps)))
}

impl RateLimits {
    /// Requests per second for each scope; zero disables that bucket.
    #[must_use]
    pub fn new(read_rps: u32, write_rps: u32) -> Self {
        Self {
            reads: bucket(read_rps),
            writes: bucket(write_rps),
        }
    }

    /// Limits from `TOOLSMITH_RATE_LIMIT` and `TOOLSMITH_WRITE_RATE_LIMIT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            env_rate("TOOLSMITH_RATE_LIMIT", DEFAULT_READ_RPS),
            env_rate("TOOLSMITH_WRITE_RATE_LIMIT", DEFAULT_WRITE_RPS),
        )
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.reads.is_none() && self.writes.is_none()
    }

    /// Take one token from the bucket of `scope`.
    #[must_use]
    pub fn admit(&self, scope: Scope) -> bool {
        let limiter = match scope {
            Scope::Read => &self.reads,
            Scope::Write => &self.writes,
        };
        limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }
}

fn env_rate(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Returns 429 once the bucket of the request's scope is empty.
pub async fn rate_limit_middleware(
    State(limits): State<Arc<RateLimits>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let scope = Scope::for_method(request.method());
    if limits.admit(scope) {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), ?scope, "rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, HeaderValue::from_static("1"))],
        "Too Many Requests",
    )
        .into_response()
}

// =============================================================================
// TESTS
// =============================================================================
