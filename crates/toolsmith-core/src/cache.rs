//! # Build Cache
//!
//! Hash-addressed store of compiled tools. A hit short-circuits code
//! generation entirely.
//!
//! Layout under the cache root:
//! - `bin/<hash>`: executables (with metadata trailer)
//! - `meta/<hash>.json`: [`ArtifactMeta`]
//! - `tmp/`: per-build staging directories
//! - `locks/<hash>.lock`: cross-process build locks
//!
//! ## Concurrency
//!
//! At most one compilation per hash is in flight. Within a process a keyed
//! mutex serializes callers; across processes a [`LockFile`] does. Whoever
//! gets the lock second re-checks the cache and observes the first caller's
//! artifact instead of compiling again. Binaries are staged in `tmp/` and
//! renamed into `bin/`, so a reader never sees a partial file.

use crate::canonical::IoContract;
use crate::formats::trailer::{TrailerPayload, append_trailer, read_trailer};
use crate::memory::ArtifactProbe;
use crate::storage::{LockFile, copy_atomic, unix_now, write_atomic};
use crate::{Capability, ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time to wait for another builder of the same hash.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// TYPES
// =============================================================================

/// A compiled tool. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub hash: ToolHash,
    pub binary: PathBuf,
    pub app: String,
}

/// Everything the cache stores about an artifact besides the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub hash: ToolHash,
    pub app: String,
    pub canonical: String,
    /// The manifest text exactly as first submitted for this hash.
    pub manifest: String,
    pub capabilities: BTreeSet<Capability>,
    pub io: IoContract,
    pub size: u64,
    pub created: u64,
}

/// What the session knows about a tool before it is built.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub hash: ToolHash,
    pub app: String,
    pub canonical: String,
    pub manifest: String,
    pub capabilities: BTreeSet<Capability>,
    pub io: IoContract,
}

// =============================================================================
// BUILD CACHE
// =============================================================================

/// The on-disk build cache. Cheap to share across threads.
#[derive(Debug)]
pub struct BuildCache {
    root: PathBuf,
    lock_timeout: Duration,
    inflight: Mutex<BTreeMap<ToolHash, Arc<Mutex<()>>>>,
}

impl BuildCache {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, ToolsmithError> {
        let root = root.into();
        for dir in ["bin", "meta", "tmp", "locks"] {
            fs::create_dir_all(root.join(dir)).map_err(ToolsmithError::storage)?;
        }
        Ok(Self {
            root,
            lock_timeout,
            inflight: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn binary_path(&self, hash: &ToolHash) -> PathBuf {
        self.root.join("bin").join(hash.as_str())
    }

    fn meta_path(&self, hash: &ToolHash) -> PathBuf {
        self.root.join("meta").join(format!("{hash}.json"))
    }

    fn lock_path(&self, hash: &ToolHash) -> PathBuf {
        self.root.join("locks").join(format!("{hash}.lock"))
    }

    /// Look up `hash`. `canonical` is the requester's canonical form; a
    /// stored artifact with a different canonical form is an integrity fault.
    pub fn lookup(
        &self,
        hash: &ToolHash,
        canonical: &str,
    ) -> Result<Option<CompiledArtifact>, ToolsmithError> {
        let binary = self.binary_path(hash);
        if !binary.is_file() {
            return Ok(None);
        }
        let Some(meta) = self.load_meta(hash)? else {
            warn!(hash = %hash.short(), "binary without metadata or trailer; rebuilding");
            return Ok(None);
        };
        if meta.canonical != canonical {
            return Err(ToolsmithError::HashCollisionSuspected {
                hash: hash.to_string(),
            });
        }
        debug!(hash = %hash.short(), app = %meta.app, "cache hit");
        Ok(Some(CompiledArtifact {
            hash: hash.clone(),
            binary,
            app: meta.app,
        }))
    }

    /// Return the artifact for `spec`, running `compile` only if no
    /// artifact exists yet. `compile` must write a complete executable at
    /// the path it is given.
    ///
    /// Returns the artifact and whether this call compiled it.
    pub fn insert<F>(
        &self,
        spec: &ArtifactSpec,
        compile: F,
    ) -> Result<(CompiledArtifact, bool), ToolsmithError>
    where
        F: FnOnce(&Path) -> Result<(), ToolsmithError>,
    {
        let slot = self.inflight_slot(&spec.hash);
        let result = {
            let _local = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let _lock = LockFile::acquire(&self.lock_path(&spec.hash), self.lock_timeout)?;
            match self.lookup(&spec.hash, &spec.canonical)? {
                Some(artifact) => Ok((artifact, false)),
                None => self.build(spec, compile).map(|artifact| (artifact, true)),
            }
        };
        self.release_slot(&spec.hash, slot);
        result
    }

    fn inflight_slot(&self, hash: &ToolHash) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(hash.clone()).or_default())
    }

    fn release_slot(&self, hash: &ToolHash, slot: Arc<Mutex<()>>) {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // map + this caller; anyone else still waiting keeps the entry alive
        if Arc::strong_count(&slot) <= 2 {
            map.remove(hash);
        }
    }

    fn build<F>(&self, spec: &ArtifactSpec, compile: F) -> Result<CompiledArtifact, ToolsmithError>
    where
        F: FnOnce(&Path) -> Result<(), ToolsmithError>,
    {
        let staging = tempfile::Builder::new()
            .prefix(".build-")
            .tempdir_in(self.root.join("tmp"))
            .map_err(ToolsmithError::storage)?;
        let staged = staging.path().join(spec.hash.as_str());

        info!(hash = %spec.hash.short(), app = %spec.app, "cache miss, compiling");
        compile(&staged)?;
        if !staged.is_file() {
            return Err(ToolsmithError::Backend {
                detail: "backend reported success but produced no executable".to_string(),
            });
        }

        append_trailer(
            &staged,
            &TrailerPayload {
                app: spec.app.clone(),
                hash: spec.hash.clone(),
                capabilities: spec.capabilities.clone(),
                inputs: spec.io.inputs.clone(),
                outputs: spec.io.outputs.clone(),
                canonical: spec.canonical.clone(),
            },
        )?;
        make_executable(&staged)?;
        let size = fs::metadata(&staged).map_err(ToolsmithError::storage)?.len();

        let binary = self.binary_path(&spec.hash);
        fs::rename(&staged, &binary).map_err(ToolsmithError::storage)?;

        let meta = ArtifactMeta {
            hash: spec.hash.clone(),
            app: spec.app.clone(),
            canonical: spec.canonical.clone(),
            manifest: spec.manifest.clone(),
            capabilities: spec.capabilities.clone(),
            io: spec.io.clone(),
            size,
            created: unix_now(),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(ToolsmithError::storage)?;
        write_atomic(&self.meta_path(&spec.hash), &json)?;

        info!(hash = %spec.hash.short(), app = %spec.app, size, "artifact published");
        Ok(CompiledArtifact {
            hash: spec.hash.clone(),
            binary,
            app: spec.app.clone(),
        })
    }

    /// Metadata for `hash`, falling back to the binary's trailer.
    pub fn load_meta(&self, hash: &ToolHash) -> Result<Option<ArtifactMeta>, ToolsmithError> {
        let path = self.meta_path(hash);
        match fs::read(&path) {
            Ok(bytes) => {
                return serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                    ToolsmithError::Storage(format!("corrupt metadata {}: {e}", path.display()))
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ToolsmithError::storage(e)),
        }

        let binary = self.binary_path(hash);
        if !binary.is_file() {
            return Ok(None);
        }
        let size = fs::metadata(&binary).map_err(ToolsmithError::storage)?.len();
        Ok(read_trailer(&binary)?.map(|t| ArtifactMeta {
            hash: t.hash,
            app: t.app,
            // the canonical form is itself a valid manifest document
            manifest: t.canonical.clone(),
            canonical: t.canonical,
            capabilities: t.capabilities,
            io: IoContract {
                inputs: t.inputs,
                outputs: t.outputs,
            },
            size,
            created: 0,
        }))
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Every artifact with a binary, ordered by app then hash.
    pub fn list(&self) -> Result<Vec<ArtifactMeta>, ToolsmithError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(self.root.join("bin")).map_err(ToolsmithError::storage)?;
        for entry in entries {
            let entry = entry.map_err(ToolsmithError::storage)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !ToolHash::is_well_formed(&name) {
                continue;
            }
            match self.load_meta(&ToolHash::new(name)) {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping unreadable artifact"),
            }
        }
        out.sort_by(|a, b| a.app.cmp(&b.app).then_with(|| a.hash.cmp(&b.hash)));
        Ok(out)
    }

    /// Artifacts matching `key`: a hash prefix, or an exact app name.
    fn resolve(&self, key: &str) -> Result<(Vec<ArtifactMeta>, bool), ToolsmithError> {
        let all = self.list()?;
        let by_app: Vec<ArtifactMeta> = all.iter().filter(|m| m.app == key).cloned().collect();
        if !by_app.is_empty() {
            return Ok((by_app, true));
        }
        let by_hash = all
            .into_iter()
            .filter(|m| !key.is_empty() && m.hash.as_str().starts_with(key))
            .collect();
        Ok((by_hash, false))
    }

    /// Metadata for a single artifact named by hash prefix or app name.
    pub fn info(&self, key: &str) -> Result<ArtifactMeta, ToolsmithError> {
        let (mut matches, _) = self.resolve(key)?;
        match matches.len() {
            0 => Err(ToolsmithError::RecordNotFound {
                prefix: key.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(ToolsmithError::AmbiguousHashPrefix {
                prefix: key.to_string(),
                candidates: matches.into_iter().map(|m| m.hash.0).collect(),
            }),
        }
    }

    /// Remove artifacts. An app name removes every build of that app; a hash
    /// prefix must be unambiguous.
    pub fn forget(&self, key: &str) -> Result<Vec<ToolHash>, ToolsmithError> {
        let (matches, by_app) = self.resolve(key)?;
        if matches.is_empty() {
            return Err(ToolsmithError::RecordNotFound {
                prefix: key.to_string(),
            });
        }
        if !by_app && matches.len() > 1 {
            return Err(ToolsmithError::AmbiguousHashPrefix {
                prefix: key.to_string(),
                candidates: matches.into_iter().map(|m| m.hash.0).collect(),
            });
        }
        let mut removed = Vec::with_capacity(matches.len());
        for meta in matches {
            self.remove(&meta.hash)?;
            removed.push(meta.hash);
        }
        Ok(removed)
    }

    /// Remove every artifact. Returns how many binaries were removed.
    pub fn clear(&self) -> Result<usize, ToolsmithError> {
        let mut count = 0;
        let entries = fs::read_dir(self.root.join("bin")).map_err(ToolsmithError::storage)?;
        for entry in entries {
            let entry = entry.map_err(ToolsmithError::storage)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if ToolHash::is_well_formed(&name) {
                self.remove(&ToolHash::new(name))?;
                count += 1;
            }
        }
        info!(count, "cache cleared");
        Ok(count)
    }

    fn remove(&self, hash: &ToolHash) -> Result<(), ToolsmithError> {
        for path in [self.binary_path(hash), self.meta_path(hash)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ToolsmithError::storage(e)),
            }
        }
        debug!(hash = %hash.short(), "artifact removed");
        Ok(())
    }
}

impl BuildCache {
    /// Copy the cached binary of `hash` to `dest`. The cache keeps its copy.
    pub fn export(&self, hash: &ToolHash, dest: &Path) -> Result<(), ToolsmithError> {
        let binary = self.binary_path(hash);
        if !binary.is_file() {
            return Err(ToolsmithError::RecordNotFound {
                prefix: hash.to_string(),
            });
        }
        copy_atomic(&binary, dest)?;
        info!(hash = %hash.short(), dest = %dest.display(), "binary exported");
        Ok(())
    }
}

impl ArtifactProbe for BuildCache {
    fn binary_exists(&self, hash: &ToolHash) -> bool {
        self.binary_path(hash).is_file()
    }

    fn load_manifest(&self, hash: &ToolHash) -> Result<Option<String>, ToolsmithError> {
        Ok(self.load_meta(hash)?.map(|m| m.manifest))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ToolsmithError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(ToolsmithError::storage)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ToolsmithError> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::canonical::hash_canonical;
    use tempfile::tempdir;

    fn spec(canonical: &str, app: &str) -> ArtifactSpec {
        ArtifactSpec {
            hash: hash_canonical(canonical),
            app: app.to_string(),
            canonical: canonical.to_string(),
            manifest: canonical.to_string(),
            capabilities: BTreeSet::new(),
            io: IoContract::default(),
        }
    }

    fn fake_compile(out: &Path) -> Result<(), ToolsmithError> {
        fs::write(out, b"#!/bin/sh\n").map_err(ToolsmithError::storage)
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let s = spec("{\"a\":1}", "one");

        assert!(cache.lookup(&s.hash, &s.canonical).unwrap().is_none());
        let (first, compiled) = cache.insert(&s, fake_compile).unwrap();
        assert!(compiled);
        assert!(first.binary.is_file());

        let (second, compiled) = cache
            .insert(&s, |_| panic!("must not compile twice"))
            .unwrap();
        assert!(!compiled);
        assert_eq!(first, second);
        assert!(cache.binary_exists(&s.hash));
    }

    #[test]
    fn canonical_mismatch_is_collision() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let s = spec("{\"a\":1}", "one");
        cache.insert(&s, fake_compile).unwrap();
        let err = cache.lookup(&s.hash, "{\"a\":2}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HashCollisionSuspected);
    }

    #[test]
    fn failed_compile_publishes_nothing() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let s = spec("{\"a\":1}", "one");
        let err = cache
            .insert(&s, |_| {
                Err(ToolsmithError::Backend {
                    detail: "boom".to_string(),
                })
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert!(!cache.binary_exists(&s.hash));
        assert!(cache.list().unwrap().is_empty());
        assert!(!cache.lock_path(&s.hash).exists());
    }

    #[test]
    fn meta_falls_back_to_trailer() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let s = spec("{\"a\":1}", "one");
        cache.insert(&s, fake_compile).unwrap();
        fs::remove_file(cache.meta_path(&s.hash)).unwrap();

        let meta = cache.load_meta(&s.hash).unwrap().unwrap();
        assert_eq!(meta.app, "one");
        assert_eq!(meta.canonical, s.canonical);
        assert!(cache.lookup(&s.hash, &s.canonical).unwrap().is_some());
    }

    #[test]
    fn export_copies_an_executable() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path().join("cache"), DEFAULT_LOCK_TIMEOUT).unwrap();
        let s = spec("{\"a\":1}", "one");
        let dest = dir.path().join("bin").join("one");
        assert_eq!(
            cache.export(&s.hash, &dest).unwrap_err().kind(),
            ErrorKind::RecordNotFound
        );

        cache.insert(&s, fake_compile).unwrap();
        cache.export(&s.hash, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), fs::read(cache.binary_path(&s.hash)).unwrap());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
        assert!(cache.binary_exists(&s.hash));
    }

    #[test]
    fn info_forget_clear() {
        let dir = tempdir().expect("temp dir");
        let cache = BuildCache::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let a = spec("{\"a\":1}", "alpha");
        let b = spec("{\"b\":1}", "beta");
        let b2 = spec("{\"b\":2}", "beta");
        for s in [&a, &b, &b2] {
            cache.insert(s, fake_compile).unwrap();
        }

        assert_eq!(cache.list().unwrap().len(), 3);
        assert_eq!(cache.info("alpha").unwrap().hash, a.hash);
        assert_eq!(cache.info(a.hash.short()).unwrap().app, "alpha");
        assert_eq!(
            cache.info("beta").unwrap_err().kind(),
            ErrorKind::AmbiguousHashPrefix
        );
        assert_eq!(
            cache.info("gamma").unwrap_err().kind(),
            ErrorKind::RecordNotFound
        );

        let removed = cache.forget("beta").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!cache.binary_exists(&b.hash));
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.list().unwrap().is_empty());
    }
}
