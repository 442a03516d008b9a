//! # Session Module
//!
//! The compose pipeline end to end:
//!
//! ```text
//! source -> parse -> validate -> canonicalize/hash -> cache lookup
//!        -> (miss) generate -> backend -> trailer -> publish
//!        -> memory record / touch
//! ```
//!
//! A cache hit never reaches code generation. Every failure before the
//! backend is a pure function of the manifest text and the catalog version.

use crate::cache::{ArtifactSpec, BuildCache, DEFAULT_LOCK_TIMEOUT};
use crate::canonical::{IoContract, IoPort, canonicalize, pattern};
use crate::catalog::Catalog;
use crate::codegen::{Backend, Program, generate};
use crate::manifest::Manifest;
use crate::memory::{MemoryRecord, MemoryStore, RecordUpdate, normalize_tags};
use crate::query::MemoryQuery;
use crate::validator::{ValidatedGraph, validate};
use crate::{Capability, ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// REQUEST / RESPONSE TYPES
// =============================================================================

/// Memory options for [`Session::compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileRequest {
    pub goal: Option<String>,
    pub tags: Vec<String>,
    /// Write to tool memory at all.
    pub store: bool,
}

impl CompileRequest {
    /// Record in memory with no goal or tags.
    #[must_use]
    pub fn recorded() -> Self {
        Self {
            store: true,
            ..Self::default()
        }
    }

    fn has_annotations(&self) -> bool {
        self.goal.as_deref().is_some_and(|g| !g.trim().is_empty())
            || self.tags.iter().any(|t| !t.trim().is_empty())
    }
}

/// Result of a successful compose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub hash: ToolHash,
    pub binary: PathBuf,
    pub app: String,
    /// Served from the build cache without compiling.
    pub cached: bool,
    pub capabilities: BTreeSet<Capability>,
    pub inputs: Vec<IoPort>,
    pub outputs: Vec<IoPort>,
}

/// Result of `check`: everything known about a manifest short of building it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub app: String,
    pub hash: ToolHash,
    pub capabilities: BTreeSet<Capability>,
    pub required_capabilities: BTreeSet<Capability>,
    pub io_signature: String,
    pub pattern: String,
    pub inputs: Vec<IoPort>,
    pub outputs: Vec<IoPort>,
    /// An artifact for this hash is already cached.
    pub cached: bool,
}

// =============================================================================
// SESSION
// =============================================================================

/// Catalog, cache, memory and backend for one process.
pub struct Session {
    catalog: Catalog,
    cache: BuildCache,
    memory: MemoryStore,
    backend: Box<dyn Backend>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache", &self.cache.root())
            .field("memory", &self.memory)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(cache: BuildCache, memory: MemoryStore, backend: impl Backend + 'static) -> Self {
        Self {
            catalog: Catalog::builtin(),
            cache,
            memory,
            backend: Box::new(backend),
        }
    }

    /// Standard layout under `home`: `cache/` and `memory.json`.
    pub fn open_home(
        home: &Path,
        lock_timeout: Option<Duration>,
        backend: impl Backend + 'static,
    ) -> Result<Self, ToolsmithError> {
        let cache = BuildCache::open(
            home.join("cache"),
            lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
        )?;
        let memory = MemoryStore::open_flat_file(home.join("memory.json"))?;
        Ok(Self::new(cache, memory, backend))
    }

    /// Replace the memory store (e.g. to attach a mirror).
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Search, show, related and relate against this session's memory.
    #[must_use]
    pub fn query(&self) -> MemoryQuery<'_> {
        MemoryQuery::new(&self.memory, &self.cache)
    }

    // =========================================================================
    // PIPELINE
    // =========================================================================

    fn front_end(&self, source: &str) -> Result<ValidatedGraph, ToolsmithError> {
        let manifest = Manifest::parse(source)?;
        validate(manifest, &self.catalog)
    }

    /// Parse, validate and hash without building.
    pub fn check(&self, source: &str) -> Result<CheckReport, ToolsmithError> {
        let graph = self.front_end(source)?;
        let canonical = canonicalize(&graph);
        let io = IoContract::derive(&graph);
        let cached = self.cache.lookup(&canonical.hash, &canonical.text)?.is_some();
        Ok(CheckReport {
            app: graph.app().to_string(),
            hash: canonical.hash,
            capabilities: graph.declared_capabilities().clone(),
            required_capabilities: graph.required_capabilities().clone(),
            io_signature: io.signature(),
            pattern: pattern(&graph),
            inputs: io.inputs,
            outputs: io.outputs,
            cached,
        })
    }

    /// The program the backend would compile.
    pub fn expand(&self, source: &str) -> Result<Program, ToolsmithError> {
        Ok(generate(&self.front_end(source)?))
    }

    /// Compose `source` into a cached executable.
    pub fn compile(
        &self,
        source: &str,
        request: &CompileRequest,
    ) -> Result<CompileOutcome, ToolsmithError> {
        let graph = self.front_end(source)?;
        let canonical = canonicalize(&graph);
        let io = IoContract::derive(&graph);
        debug!(app = %graph.app(), hash = %canonical.hash.short(), "manifest validated");

        let spec = ArtifactSpec {
            hash: canonical.hash.clone(),
            app: graph.app().to_string(),
            canonical: canonical.text.clone(),
            manifest: source.to_string(),
            capabilities: graph.declared_capabilities().clone(),
            io: io.clone(),
        };

        let (artifact, compiled) = match self.cache.lookup(&spec.hash, &spec.canonical)? {
            Some(hit) => (hit, false),
            None => self.cache.insert(&spec, |out| {
                let program = generate(&graph);
                self.backend.compile(&program, out)
            })?,
        };
        info!(
            app = %artifact.app,
            hash = %artifact.hash.short(),
            cached = !compiled,
            "compose finished"
        );

        if request.store {
            self.remember(&graph, &spec, &io, request, compiled)?;
        }

        Ok(CompileOutcome {
            hash: artifact.hash,
            binary: artifact.binary,
            app: artifact.app,
            cached: !compiled,
            capabilities: spec.capabilities,
            inputs: io.inputs,
            outputs: io.outputs,
        })
    }

    fn remember(
        &self,
        graph: &ValidatedGraph,
        spec: &ArtifactSpec,
        io: &IoContract,
        request: &CompileRequest,
        compiled: bool,
    ) -> Result<MemoryRecord, ToolsmithError> {
        if !compiled && !request.has_annotations() {
            if let Some(record) = self.memory.touch(&spec.hash)? {
                return Ok(record);
            }
        }
        self.memory.record(&RecordUpdate {
            hash: spec.hash.clone(),
            app: spec.app.clone(),
            goal: request.goal.clone().unwrap_or_default(),
            tags: normalize_tags(&request.tags),
            io_signature: io.signature(),
            pattern: pattern(graph),
            capabilities: spec.capabilities.clone(),
        })
    }

    /// Attach a goal and tags to an already-built tool, named by hash
    /// prefix or app name.
    pub fn annotate(
        &self,
        key: &str,
        goal: Option<&str>,
        tags: &[String],
    ) -> Result<MemoryRecord, ToolsmithError> {
        let meta = self.cache.info(key)?;
        let manifest = Manifest::parse(&meta.manifest)?;
        let pattern = manifest
            .nodes
            .iter()
            .map(|n| n.primitive.as_str())
            .collect::<Vec<_>>()
            .join(">");
        self.memory.record(&RecordUpdate {
            hash: meta.hash,
            app: meta.app,
            goal: goal.unwrap_or_default().to_string(),
            tags: normalize_tags(tags),
            io_signature: meta.io.signature(),
            pattern,
            capabilities: meta.capabilities,
        })
    }
}
