//! # Toolsmith Application Library
//!
//! The async, network-aware half of toolsmith, exposed as a library so the
//! binary and the integration tests share one implementation.
//!
//! - [`cli`]: command-line interface over a [`toolsmith_core::Session`]
//! - [`config`]: TOML configuration with environment overrides
//! - [`api`]: the memory server (networked tool memory)
//! - [`remote`]: the HTTP mirror that dual-writes to a memory server

pub mod api;
pub mod cli;
pub mod config;
pub mod remote;
