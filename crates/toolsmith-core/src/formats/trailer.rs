//! # Binary Metadata Trailer
//!
//! Compiled tools carry their own description so a binary copied out of the
//! cache can still be identified with `inspect`.
//!
//! Layout, appended after the executable image:
//! - N bytes: JSON payload ([`TrailerPayload`])
//! - 8 bytes: N as little-endian u64
//! - 8 bytes: magic ("TSMETA\0\x01")
//!
//! Loaders ignore bytes past the image, so the trailer does not affect
//! execution.
//!
//! ## Security
//!
//! The length field is checked against the file size and
//! [`MAX_TRAILER_PAYLOAD`] before any allocation.

use crate::canonical::IoPort;
use crate::primitives::{MAX_TRAILER_PAYLOAD, TRAILER_MAGIC};
use crate::{Capability, ToolHash, ToolsmithError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Length field plus magic.
const FOOTER_LEN: u64 = 16;

/// Self-description embedded in every compiled tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailerPayload {
    pub app: String,
    pub hash: ToolHash,
    pub capabilities: BTreeSet<Capability>,
    pub inputs: Vec<IoPort>,
    pub outputs: Vec<IoPort>,
    pub canonical: String,
}

// =============================================================================
// PURE ENCODING
// =============================================================================

/// Encode a trailer (payload + length + magic).
pub fn encode_trailer(payload: &TrailerPayload) -> Result<Vec<u8>, ToolsmithError> {
    let json = serde_json::to_vec(payload).map_err(ToolsmithError::storage)?;
    let mut out = Vec::with_capacity(json.len() + FOOTER_LEN as usize);
    out.extend_from_slice(&json);
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(TRAILER_MAGIC);
    Ok(out)
}

/// Decode the trailer at the end of `bytes`, if there is one.
///
/// Returns `Ok(None)` when the magic is absent; a present magic with a
/// corrupt payload is an error.
pub fn decode_trailer(bytes: &[u8]) -> Result<Option<TrailerPayload>, ToolsmithError> {
    let total = bytes.len() as u64;
    let Some(payload_len) = footer_payload_len(total, bytes.get(bytes.len().saturating_sub(16)..))
    else {
        return Ok(None);
    };
    let start = (total - FOOTER_LEN - payload_len) as usize;
    let end = (total - FOOTER_LEN) as usize;
    parse_payload(&bytes[start..end]).map(Some)
}

fn footer_payload_len(total: u64, footer: Option<&[u8]>) -> Option<u64> {
    let footer = footer?;
    if total < FOOTER_LEN || footer.len() != FOOTER_LEN as usize {
        return None;
    }
    if &footer[8..] != TRAILER_MAGIC {
        return None;
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&footer[..8]);
    let payload_len = u64::from_le_bytes(len_bytes);
    if payload_len > MAX_TRAILER_PAYLOAD || payload_len > total - FOOTER_LEN {
        return None;
    }
    Some(payload_len)
}

fn parse_payload(bytes: &[u8]) -> Result<TrailerPayload, ToolsmithError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ToolsmithError::Storage(format!("corrupt trailer payload: {e}")))
}

// =============================================================================
// FILE I/O
// =============================================================================

/// Append a trailer to the file at `path`.
pub fn append_trailer(path: &Path, payload: &TrailerPayload) -> Result<(), ToolsmithError> {
    let bytes = encode_trailer(payload)?;
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(ToolsmithError::storage)?;
    file.write_all(&bytes).map_err(ToolsmithError::storage)?;
    file.sync_all().map_err(ToolsmithError::storage)
}

/// Read the trailer from the file at `path` without loading the whole file.
pub fn read_trailer(path: &Path) -> Result<Option<TrailerPayload>, ToolsmithError> {
    let mut file = File::open(path).map_err(ToolsmithError::storage)?;
    let total = file.metadata().map_err(ToolsmithError::storage)?.len();
    if total < FOOTER_LEN {
        return Ok(None);
    }

    let mut footer = [0u8; FOOTER_LEN as usize];
    file.seek(SeekFrom::Start(total - FOOTER_LEN))
        .map_err(ToolsmithError::storage)?;
    file.read_exact(&mut footer).map_err(ToolsmithError::storage)?;
    let Some(payload_len) = footer_payload_len(total, Some(&footer)) else {
        return Ok(None);
    };

    let mut payload = vec![0u8; payload_len as usize];
    file.seek(SeekFrom::Start(total - FOOTER_LEN - payload_len))
        .map_err(ToolsmithError::storage)?;
    file.read_exact(&mut payload).map_err(ToolsmithError::storage)?;
    parse_payload(&payload).map(Some)
}
