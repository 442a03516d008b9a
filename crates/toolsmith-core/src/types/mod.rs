//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the compose compiler and
//! the tool memory:
//! - Effect and type vocabulary (`Capability`, `ValueType`, `LiteralKind`)
//! - Parameter literals (`Literal`)
//! - Tool identity (`ToolHash`)
//! - Error types (`ToolsmithError`, `ErrorKind`, `ErrorBody`, `ErrorResponse`)
//!
//! ## Determinism Guarantees
//!
//! Every enum here derives `Ord` so that sets of them (`BTreeSet<Capability>`)
//! iterate in one fixed order. That order is the order used by the
//! canonical form, so it must never change without bumping the catalog.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::primitives::HASH_SHORT_LEN;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// A declared permission for one category of effect.
///
/// Variants are declared alphabetically so the derived `Ord` matches the
/// lexical order of their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EnvRead,
    FsRead,
    FsWrite,
    IoRead,
    IoWrite,
    NetRead,
}

impl Capability {
    /// Every capability, in canonical order.
    pub const ALL: [Capability; 6] = [
        Capability::EnvRead,
        Capability::FsRead,
        Capability::FsWrite,
        Capability::IoRead,
        Capability::IoWrite,
        Capability::NetRead,
    ];

    /// Wire name of the capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Capability::EnvRead => "env_read",
            Capability::FsRead => "fs_read",
            Capability::FsWrite => "fs_write",
            Capability::IoRead => "io_read",
            Capability::IoWrite => "io_write",
            Capability::NetRead => "net_read",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ToolsmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ToolsmithError::Parse {
                detail: format!(
                    "unknown capability \"{s}\" (expected one of: {})",
                    Capability::ALL.map(Capability::as_str).join(", ")
                ),
            })
    }
}

// =============================================================================
// VALUE TYPES & LITERALS
// =============================================================================

/// The type a node provides to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Num,
    Str,
    Bool,
    /// Produced by effect-only nodes. Nothing may bind to a sink.
    Sink,
}

impl ValueType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ValueType::Num => "num",
            ValueType::Str => "str",
            ValueType::Bool => "bool",
            ValueType::Sink => "sink",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The accepted shape of a `params` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralKind {
    /// Any finite number.
    Num,
    /// A non-negative integral number (argument indices).
    Int,
    Str,
    Bool,
}

impl LiteralKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LiteralKind::Num => "num",
            LiteralKind::Int => "int",
            LiteralKind::Str => "str",
            LiteralKind::Bool => "bool",
        }
    }
}

impl fmt::Display for LiteralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value as it appears in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Literal {
    /// Check whether this literal satisfies `kind`.
    #[must_use]
    pub fn matches(&self, kind: LiteralKind) -> bool {
        match (self, kind) {
            (Literal::Num(n), LiteralKind::Num) => n.is_finite(),
            (Literal::Num(n), LiteralKind::Int) => {
                n.is_finite() && n.fract() == 0.0 && n.is_sign_positive()
            }
            (Literal::Str(_), LiteralKind::Str) | (Literal::Bool(_), LiteralKind::Bool) => true,
            _ => false,
        }
    }

    /// Short description of the literal's shape, used in error messages.
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Literal::Bool(_) => "bool",
            Literal::Num(_) => "num",
            Literal::Str(_) => "str",
        }
    }
}

// =============================================================================
// TOOL IDENTITY
// =============================================================================

/// Content hash of a manifest's canonical form, lowercase hex.
///
/// Doubles as the build-cache key and the permanent identity of a tool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolHash(pub String);

impl ToolHash {
    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display prefix used in summaries and logs.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..HASH_SHORT_LEN).unwrap_or(&self.0)
    }

    /// Whether `s` could be a full hash: 64 lowercase hex characters.
    #[must_use]
    pub fn is_well_formed(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for ToolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Stable error taxonomy exposed to callers.
///
/// The variant name is the `kind` string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    DuplicateId,
    AppNameInvalid,
    UnknownPrimitive,
    InvalidParam,
    UndefinedReference,
    TypeMismatch,
    MissingCapability,
    NoEffect,
    BackendFailure,
    RecordNotFound,
    AmbiguousHashPrefix,
    HashCollisionSuspected,
    StorageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors that can occur in the toolsmith core.
///
/// Validation errors carry enough structure for an automated caller to
/// repair the manifest: see [`ToolsmithError::hint`] and
/// [`ToolsmithError::fields`].
#[derive(Debug, Error)]
pub enum ToolsmithError {
    /// The manifest document is malformed.
    #[error("parse error: {detail}")]
    Parse { detail: String },

    #[error("duplicate node id \"{id}\"")]
    DuplicateId { id: String },

    #[error("invalid app name \"{app}\": {reason}")]
    AppNameInvalid { app: String, reason: String },

    #[error("node \"{node}\": unknown primitive \"{primitive}\"")]
    UnknownPrimitive { node: String, primitive: String },

    /// A param or bind slot does not fit the primitive's schema.
    #[error("node \"{node}\" ({primitive}): {detail}")]
    InvalidParam {
        node: String,
        primitive: String,
        slot: String,
        detail: String,
        accepted: String,
    },

    /// A bind points at nothing, at a later node, or is missing entirely.
    #[error("node \"{node}\": slot \"{slot}\" references undefined node \"{target}\"")]
    UndefinedReference {
        node: String,
        slot: String,
        target: String,
        expected: ValueType,
    },

    #[error(
        "node \"{node}\": slot \"{slot}\" expects {expected} but \"{source_node}\" provides {found}"
    )]
    TypeMismatch {
        node: String,
        slot: String,
        source_node: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("node \"{node}\" ({primitive}) requires undeclared capability \"{capability}\"")]
    MissingCapability {
        capability: Capability,
        node: String,
        primitive: String,
    },

    #[error("manifest has no observable effect")]
    NoEffect,

    /// The code generation backend failed. `detail` is its output, verbatim.
    #[error("backend failure: {detail}")]
    Backend { detail: String },

    #[error("no record matches \"{prefix}\"")]
    RecordNotFound { prefix: String },

    #[error("hash prefix \"{prefix}\" is ambiguous ({} candidates)", .candidates.len())]
    AmbiguousHashPrefix {
        prefix: String,
        candidates: Vec<String>,
    },

    /// Two different canonical forms produced the same hash.
    #[error("hash collision suspected for {hash}")]
    HashCollisionSuspected { hash: String },

    /// Filesystem, database or serialization failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The networked store rejected or failed a request.
    #[error("mirror error: {0}")]
    Mirror(String),
}

impl ToolsmithError {
    /// Convenience constructor for storage failures.
    pub fn storage(e: impl fmt::Display) -> Self {
        ToolsmithError::Storage(e.to_string())
    }

    /// The taxonomy entry for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            ToolsmithError::Parse { .. } => ErrorKind::ParseError,
            ToolsmithError::DuplicateId { .. } => ErrorKind::DuplicateId,
            ToolsmithError::AppNameInvalid { .. } => ErrorKind::AppNameInvalid,
            ToolsmithError::UnknownPrimitive { .. } => ErrorKind::UnknownPrimitive,
            ToolsmithError::InvalidParam { .. } => ErrorKind::InvalidParam,
            ToolsmithError::UndefinedReference { .. } => ErrorKind::UndefinedReference,
            ToolsmithError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            ToolsmithError::MissingCapability { .. } => ErrorKind::MissingCapability,
            ToolsmithError::NoEffect => ErrorKind::NoEffect,
            ToolsmithError::Backend { .. } => ErrorKind::BackendFailure,
            ToolsmithError::RecordNotFound { .. } => ErrorKind::RecordNotFound,
            ToolsmithError::AmbiguousHashPrefix { .. } => ErrorKind::AmbiguousHashPrefix,
            ToolsmithError::HashCollisionSuspected { .. } => ErrorKind::HashCollisionSuspected,
            ToolsmithError::Storage(_) | ToolsmithError::Mirror(_) => ErrorKind::StorageFailure,
        }
    }

    /// A short, actionable correction.
    #[must_use]
    pub fn hint(&self) -> String {
        match self {
            ToolsmithError::Parse { .. } => {
                "send an object with \"app\", \"capabilities\" and a non-empty \"nodes\" array; \
                 each node needs \"id\" and \"use\""
                    .to_string()
            }
            ToolsmithError::DuplicateId { id } => {
                format!("rename one of the nodes called \"{id}\"; node ids must be unique")
            }
            ToolsmithError::AppNameInvalid { .. } => {
                "use 1-64 characters of lowercase letters, digits and '-', starting with a letter or digit"
                    .to_string()
            }
            ToolsmithError::UnknownPrimitive { primitive, .. } => format!(
                "\"{primitive}\" is not in the catalog; run `toolsmith primitives` for the list"
            ),
            ToolsmithError::InvalidParam { accepted, .. } => accepted.clone(),
            ToolsmithError::UndefinedReference { slot, target, expected, .. } => {
                if target.is_empty() {
                    format!("bind \"{slot}\" to an earlier node that provides {expected}")
                } else {
                    format!(
                        "\"{target}\" must be defined before it is used; bind \"{slot}\" to an earlier node providing {expected}"
                    )
                }
            }
            ToolsmithError::TypeMismatch { slot, expected, found, .. } => format!(
                "slot \"{slot}\" needs {expected}; insert a conversion or bind a node that provides {expected} instead of {found}"
            ),
            ToolsmithError::MissingCapability { capability, .. } => {
                format!("add \"{capability}\" to the capabilities array")
            }
            ToolsmithError::NoEffect => {
                "add an output node such as print_num, print_str or write_file".to_string()
            }
            ToolsmithError::Backend { .. } => {
                "the backend rejected the generated program; check the manifest against the primitive signatures"
                    .to_string()
            }
            ToolsmithError::RecordNotFound { .. } => {
                "run `toolsmith memory search` to find a recorded tool".to_string()
            }
            ToolsmithError::AmbiguousHashPrefix { .. } => {
                "use a longer prefix to pick one of the candidates".to_string()
            }
            ToolsmithError::HashCollisionSuspected { .. } => {
                "integrity fault: inspect the cached metadata and remove it with `toolsmith tools forget`"
                    .to_string()
            }
            ToolsmithError::Storage(_) => {
                "check permissions and free space under the toolsmith home directory".to_string()
            }
            ToolsmithError::Mirror(_) => {
                "check the remote memory server url and api key".to_string()
            }
        }
    }

    /// Structured details for programmatic repair.
    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, String> {
        let pairs: Vec<(&str, String)> = match self {
            ToolsmithError::Parse { detail } => vec![("detail", detail.clone())],
            ToolsmithError::DuplicateId { id } => vec![("id", id.clone())],
            ToolsmithError::AppNameInvalid { app, reason } => {
                vec![("app", app.clone()), ("reason", reason.clone())]
            }
            ToolsmithError::UnknownPrimitive { node, primitive } => {
                vec![("node", node.clone()), ("primitive", primitive.clone())]
            }
            ToolsmithError::InvalidParam { node, primitive, slot, .. } => vec![
                ("node", node.clone()),
                ("primitive", primitive.clone()),
                ("slot", slot.clone()),
            ],
            ToolsmithError::UndefinedReference { node, slot, target, expected } => vec![
                ("node", node.clone()),
                ("slot", slot.clone()),
                ("target", target.clone()),
                ("expected", expected.to_string()),
            ],
            ToolsmithError::TypeMismatch { node, slot, source_node, expected, found } => vec![
                ("node", node.clone()),
                ("slot", slot.clone()),
                ("source", source_node.clone()),
                ("expected", expected.to_string()),
                ("found", found.to_string()),
            ],
            ToolsmithError::MissingCapability { capability, node, primitive } => vec![
                ("capability", capability.to_string()),
                ("node", node.clone()),
                ("primitive", primitive.clone()),
            ],
            ToolsmithError::RecordNotFound { prefix } => vec![("prefix", prefix.clone())],
            ToolsmithError::AmbiguousHashPrefix { prefix, candidates } => vec![
                ("prefix", prefix.clone()),
                ("candidates", candidates.join(",")),
            ],
            ToolsmithError::HashCollisionSuspected { hash } => vec![("hash", hash.clone())],
            ToolsmithError::NoEffect
            | ToolsmithError::Backend { .. }
            | ToolsmithError::Storage(_)
            | ToolsmithError::Mirror(_) => Vec::new(),
        };
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// Wire form of this error.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            hint: self.hint(),
            fields: self.fields(),
        }
    }
}

/// The `error` object of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// `{"status": "error", "error": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: ErrorBody,
}

impl From<&ToolsmithError> for ErrorResponse {
    fn from(e: &ToolsmithError) -> Self {
        Self {
            status: "error".to_string(),
            error: e.to_body(),
        }
    }
}
