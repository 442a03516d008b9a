//! # toolsmith-core
//!
//! The compose compiler and tool memory for Toolsmith - THE LOGIC.
//!
//! A caller describes a program as a JSON manifest: a small dataflow graph
//! of primitives drawn from a closed catalog. This crate validates the
//! graph, derives a content hash from its canonical form, and compiles it
//! to a native executable exactly once per hash. Every built tool is
//! remembered with its goal, tags and IO shape, tools can be related to
//! each other in a general graph, and free-text notes sit alongside them.
//! The catalog can also be rendered as a GBNF grammar for constrained
//! manifest generation.
//!
//! ## Architectural Constraints
//!
//! - Synchronous and network-free: the networked store is reached through
//!   the [`Mirror`] trait implemented by the app layer
//! - Closed catalog: callers cannot add primitives
//! - Deterministic: identical manifests (modulo key order and number
//!   spelling) always hash identically
//! - A cache hit never runs code generation

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod canonical;
pub mod catalog;
pub mod codegen;
pub mod formats;
pub mod grammar;
pub mod manifest;
pub mod memory;
pub mod primitives;
pub mod query;
pub mod session;
pub mod storage;
pub mod types;
pub mod validator;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Capability, ErrorBody, ErrorKind, ErrorResponse, Literal, LiteralKind, ToolHash,
    ToolsmithError, ValueType,
};

// =============================================================================
// RE-EXPORTS: Compose Pipeline
// =============================================================================

pub use cache::{ArtifactMeta, ArtifactSpec, BuildCache, CompiledArtifact};
pub use canonical::{Canonical, IoContract, IoPort, canonicalize, hash_canonical};
pub use catalog::{Catalog, PrimitiveSignature};
pub use codegen::{Backend, Program, RustcBackend, generate};
pub use grammar::gbnf;
pub use manifest::{Manifest, NodeSpec};
pub use session::{CheckReport, CompileOutcome, CompileRequest, Session};
pub use validator::{ValidatedGraph, validate};

// =============================================================================
// RE-EXPORTS: Tool Memory
// =============================================================================

pub use memory::{
    ArtifactProbe, FlatFileMemory, MemoryBackend, MemoryNote, MemoryRecord, MemorySnapshot,
    MemoryStore, Mirror, NoArtifacts, NoteKind, NoteStatus, NoteUpdate, RecordUpdate,
    RelationEdge, SyncReport,
};
pub use query::{MemoryQuery, NoteHit, RecordSummary, RelatedEntry, SearchHit, ToolDetails};
pub use storage::RedbMemory;

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{TrailerPayload, read_trailer};
