//! # Storage Module
//!
//! Filesystem and database plumbing shared by the build cache and the
//! memory backends.
//!
//! - `atomic`: tmp + rename writes and the cross-process lock file
//! - `redb_memory`: redb-backed memory store used by the memory server

pub mod atomic;
pub mod redb_memory;

pub use atomic::{LockFile, copy_atomic, unix_now, write_atomic};
pub use redb_memory::RedbMemory;
