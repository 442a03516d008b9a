//! # Formats Module
//!
//! On-disk formats owned by the core:
//! - `trailer`: metadata appended to compiled binaries

pub mod trailer;

pub use trailer::{TrailerPayload, decode_trailer, encode_trailer, read_trailer, append_trailer};
