//! # Fixed Limits and Format Constants
//!
//! Hardcoded constants for the toolsmith CORE. These are compiled into the
//! binary and are immutable at runtime. Anything that changes the canonical
//! form or an on-disk format is versioned here.

/// Version of the primitive catalog. Part of every canonical form, so a
/// catalog change can never alias an older tool's hash.
pub const CATALOG_VERSION: u32 = 1;

/// Domain prefix mixed into every manifest hash.
pub const HASH_DOMAIN: &str = "toolsmith-manifest-v1\n";

/// Domain prefix mixed into every note hash.
pub const NOTE_HASH_DOMAIN: &str = "toolsmith-note-v1\n";

/// Number of hex characters shown for a hash in summaries.
pub const HASH_SHORT_LEN: usize = 12;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum byte length of a manifest `app` name.
pub const MAX_APP_NAME_LEN: usize = 64;

/// Maximum byte length of a relation label.
pub const MAX_LABEL_LEN: usize = 64;

/// Upper bound on `repeat_str` repetitions in generated programs.
pub const MAX_REPEAT_COUNT: u64 = 100_000;

/// Upper bound on `repeat_str` output size (bytes) in generated programs.
pub const MAX_REPEAT_BYTES: u64 = 10 * 1024 * 1024;

// =============================================================================
// QUERY LIMITS
// =============================================================================

/// Maximum depth for `related` traversal.
///
/// The relation graph may contain cycles; the visited set keeps traversal
/// finite, this keeps it cheap.
pub const MAX_RELATED_DEPTH: usize = 4;

/// Depth used by `related` when the caller does not ask for one.
pub const DEFAULT_RELATED_DEPTH: usize = 1;

/// Number of results `search` returns when the caller does not ask.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Number of entries `log` returns when the caller does not ask.
pub const DEFAULT_LOG_LIMIT: usize = 20;

/// Number of notes `notes` lists when the caller does not ask.
pub const DEFAULT_NOTES_LIMIT: usize = 20;

// =============================================================================
// ON-DISK FORMATS
// =============================================================================

/// Magic bytes closing the metadata trailer appended to compiled binaries.
pub const TRAILER_MAGIC: &[u8; 8] = b"TSMETA\0\x01";

/// Upper bound on a trailer payload. Larger length fields are treated as
/// "no trailer" rather than trusted.
pub const MAX_TRAILER_PAYLOAD: u64 = 4 * 1024 * 1024;

/// Format version of the memory stores.
///
/// Version 2 added notes and edge notes. The flat file still reads version 1
/// documents; the redb store does not, since its postcard values changed
/// shape.
pub const MEMORY_FORMAT_VERSION: u32 = 2;
