//! # Atomic Writes and Lock Files
//!
//! Readers must never observe a partially written file. Every write goes to
//! a temporary file in the destination directory and is renamed into place.
//!
//! [`LockFile`] provides cross-process mutual exclusion with a `create_new`
//! lock file, polled until a timeout. The file holds the owner's pid and a
//! per-acquisition token. While held, a heartbeat thread refreshes its
//! mtime, so only a lock whose holder stopped refreshing it (a crashed
//! process) ever goes stale. Staleness uses its own threshold, independent
//! of how long a waiter is willing to wait.

use crate::ToolsmithError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Interval between attempts to take a held lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A lock not refreshed for this long belongs to a dead holder.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Heartbeats per stale period.
const HEARTBEATS_PER_STALE_PERIOD: u32 = 4;

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Current time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write `contents` to `path` atomically (tmp + rename in the same directory).
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ToolsmithError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(ToolsmithError::storage)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(ToolsmithError::storage)?;
    tmp.write_all(contents).map_err(ToolsmithError::storage)?;
    tmp.as_file().sync_all().map_err(ToolsmithError::storage)?;
    tmp.persist(path)
        .map_err(|e| ToolsmithError::Storage(format!("failed to persist {}: {e}", path.display())))?;
    Ok(())
}

/// Copy `src` to `dest` through a temporary sibling of `dest`, keeping the
/// permission bits of `src`.
pub fn copy_atomic(src: &Path, dest: &Path) -> Result<(), ToolsmithError> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(ToolsmithError::storage)?;

    let mut source = fs::File::open(src)
        .map_err(|e| ToolsmithError::Storage(format!("cannot open {}: {e}", src.display())))?;
    let permissions = source.metadata().map_err(ToolsmithError::storage)?.permissions();
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(ToolsmithError::storage)?;
    std::io::copy(&mut source, tmp.as_file_mut()).map_err(ToolsmithError::storage)?;
    tmp.as_file().set_permissions(permissions).map_err(ToolsmithError::storage)?;
    tmp.as_file().sync_all().map_err(ToolsmithError::storage)?;
    tmp.persist(dest)
        .map_err(|e| ToolsmithError::Storage(format!("failed to persist {}: {e}", dest.display())))?;
    Ok(())
}

// =============================================================================
// LOCK FILE
// =============================================================================

/// A held cross-process lock. Released on drop, if still ours.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockFile {
    /// Take the lock at `path`, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, ToolsmithError> {
        Self::acquire_with(path, timeout, LOCK_STALE_AFTER)
    }

    /// Take the lock at `path`, waiting up to `timeout`. A lock left
    /// unrefreshed for `stale_after` is broken.
    pub fn acquire_with(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, ToolsmithError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ToolsmithError::storage)?;
        }
        let token = new_token();
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", token).map_err(ToolsmithError::storage)?;
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self::held(path, token, stale_after));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path, stale_after) && break_stale(path, stale_after) {
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(ToolsmithError::Storage(format!(
                            "timed out after {}ms waiting for lock {} (held by {})",
                            timeout.as_millis(),
                            path.display(),
                            read_owner(path).unwrap_or_else(|| "unknown".to_string())
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(ToolsmithError::storage(e)),
            }
        }
    }

    fn held(path: &Path, token: String, stale_after: Duration) -> Self {
        let (stop, ticks) = mpsc::channel::<()>();
        let interval = stale_after / HEARTBEATS_PER_STALE_PERIOD;
        let heartbeat = {
            let path = path.to_path_buf();
            let token = token.clone();
            std::thread::Builder::new()
                .name("toolsmith-lock".to_string())
                .spawn(move || {
                    while let Err(RecvTimeoutError::Timeout) = ticks.recv_timeout(interval) {
                        if !refresh(&path, &token) {
                            warn!(lock = %path.display(), "lock taken over by another process");
                            break;
                        }
                    }
                })
                .map_err(|e| warn!(error = %e, "lock heartbeat not started"))
                .ok()
        };
        Self {
            path: path.to_path_buf(),
            token,
            stop: Some(stop),
            heartbeat,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owner line written into the lock file: `<pid> <token>`.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.join();
        }
        if read_owner(&self.path).as_deref() == Some(self.token.as_str()) {
            let _ = fs::remove_file(&self.path);
        } else {
            warn!(lock = %self.path.display(), "lock no longer ours; leaving it in place");
        }
    }
}

fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = LOCK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{} {nanos:x}-{seq}", std::process::id())
}

fn read_owner(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Bump the mtime of a lock we still own.
fn refresh(path: &Path, token: &str) -> bool {
    if read_owner(path).as_deref() != Some(token) {
        return false;
    }
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()))
        .is_ok()
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

/// Move a stale lock aside and delete it. If it turned out to be fresh
/// (refreshed or replaced since we looked), put it back.
fn break_stale(path: &Path, stale_after: Duration) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = path.with_file_name(format!(
        "{name}.stale-{}-{}",
        std::process::id(),
        LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    if fs::rename(path, &aside).is_err() {
        // another waiter got there first
        return false;
    }
    if is_stale(&aside, stale_after) {
        warn!(
            lock = %path.display(),
            owner = read_owner(&aside).unwrap_or_default(),
            "removing stale lock"
        );
        let _ = fs::remove_file(&aside);
        return true;
    }
    if fs::hard_link(&aside, path).is_err() {
        warn!(lock = %path.display(), "could not restore a live lock");
    }
    let _ = fs::remove_file(&aside);
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    #[cfg(unix)]
    fn copy_atomic_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("temp dir");
        let src = dir.path().join("tool");
        fs::write(&src, b"#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let dest = dir.path().join("out").join("hi");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"old").unwrap();
        copy_atomic(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(copy_atomic(&dir.path().join("missing"), &dest).is_err());
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn second_holder_waits_for_release() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("x.lock");
        let held = LockFile::acquire(&path, Duration::from_secs(30)).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let lock = LockFile::acquire(&path, Duration::from_secs(30)).unwrap();
                acquired.store(true, Ordering::SeqCst);
                drop(lock);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!path.exists());
    }

    fn backdate(path: &Path, by: Duration) {
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("y.lock");
        fs::write(&path, b"12345 dead-0").unwrap();
        backdate(&path, Duration::from_secs(60));
        let lock = LockFile::acquire_with(&path, Duration::from_millis(10), Duration::from_secs(1))
            .unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert_eq!(read_owner(&path).as_deref(), Some(lock.token()));
    }

    #[test]
    fn live_holder_outlasting_the_wait_keeps_its_lock() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("z.lock");
        let stale_after = Duration::from_millis(200);
        let holder = LockFile::acquire_with(&path, Duration::from_secs(1), stale_after).unwrap();

        // well past both the waiter's timeout and the stale threshold
        std::thread::sleep(Duration::from_millis(600));
        let err = LockFile::acquire_with(&path, Duration::from_millis(300), stale_after).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(read_owner(&path).as_deref(), Some(holder.token()));

        drop(holder);
        assert!(!path.exists());
    }

    #[test]
    fn drop_leaves_a_lock_owned_by_someone_else() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("w.lock");
        let lock = LockFile::acquire(&path, Duration::from_secs(1)).unwrap();
        fs::write(&path, b"999 someone-else").unwrap();
        drop(lock);
        assert_eq!(read_owner(&path).as_deref(), Some("999 someone-else"));
    }

    #[test]
    fn fresh_lock_moved_aside_is_restored() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("v.lock");
        fs::write(&path, b"1 live").unwrap();
        assert!(!break_stale(&path, Duration::from_secs(60)));
        assert_eq!(read_owner(&path).as_deref(), Some("1 live"));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn unix_now_is_after_2020() {
        assert!(unix_now() > 1_577_836_800);
    }
}
