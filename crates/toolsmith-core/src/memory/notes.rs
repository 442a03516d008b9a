//! Contextual notes: short free-text entries (discoveries, decisions,
//! patterns, issues) kept next to the tool records.
//!
//! A note is addressed by the hash of its kind and summary, so recording the
//! same observation twice updates one entry instead of adding another.

use crate::ToolsmithError;
use crate::memory::normalize_tags;
use crate::primitives::NOTE_HASH_DOMAIN;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// What a note records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Discovery,
    Decision,
    Pattern,
    Issue,
}

impl NoteKind {
    pub const ALL: [NoteKind; 4] = [
        NoteKind::Discovery,
        NoteKind::Decision,
        NoteKind::Pattern,
        NoteKind::Issue,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NoteKind::Discovery => "discovery",
            NoteKind::Decision => "decision",
            NoteKind::Pattern => "pattern",
            NoteKind::Issue => "issue",
        }
    }
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteKind {
    type Err = ToolsmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NoteKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ToolsmithError::Parse {
                detail: format!(
                    "unknown note kind \"{s}\" (valid: discovery, decision, pattern, issue)"
                ),
            })
    }
}

/// Lifecycle of a note. Only active notes are expected to still hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    #[default]
    Active,
    Resolved,
    Superseded,
}

impl NoteStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NoteStatus::Active => "active",
            NoteStatus::Resolved => "resolved",
            NoteStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteStatus {
    type Err = ToolsmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(NoteStatus::Active),
            "resolved" => Ok(NoteStatus::Resolved),
            "superseded" => Ok(NoteStatus::Superseded),
            other => Err(ToolsmithError::Parse {
                detail: format!(
                    "unknown note status \"{other}\" (valid: active, resolved, superseded)"
                ),
            }),
        }
    }
}

/// A stored note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNote {
    pub hash: String,
    pub kind: NoteKind,
    pub summary: String,
    pub detail: String,
    pub context: String,
    pub tags: BTreeSet<String>,
    pub created: u64,
    pub status: NoteStatus,
}

/// Input to [`crate::MemoryStore::note`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteUpdate {
    pub kind: NoteKind,
    pub summary: String,
    pub detail: String,
    pub context: String,
    pub tags: BTreeSet<String>,
}

impl NoteUpdate {
    /// Build an update, trimming text and normalizing tags. The summary
    /// must not be empty.
    pub fn new<I, S>(
        kind: NoteKind,
        summary: &str,
        detail: &str,
        context: &str,
        tags: I,
    ) -> Result<Self, ToolsmithError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ToolsmithError::Parse {
                detail: "note summary must not be empty".to_string(),
            });
        }
        Ok(Self {
            kind,
            summary: summary.to_string(),
            detail: detail.trim().to_string(),
            context: context.trim().to_string(),
            tags: normalize_tags(tags),
        })
    }

    #[must_use]
    pub fn hash(&self) -> String {
        note_hash(self.kind, &self.summary)
    }
}

/// Content address of a note: BLAKE3 over a domain prefix, the kind and the
/// summary.
#[must_use]
pub fn note_hash(kind: NoteKind, summary: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NOTE_HASH_DOMAIN.as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(summary.trim().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Merge an update into an existing note.
///
/// Non-empty detail and context replace the old values, tags are unioned,
/// `created` and `status` are kept.
#[must_use]
pub fn merge_note(existing: Option<MemoryNote>, update: &NoteUpdate, now: u64) -> MemoryNote {
    match existing {
        None => MemoryNote {
            hash: update.hash(),
            kind: update.kind,
            summary: update.summary.clone(),
            detail: update.detail.clone(),
            context: update.context.clone(),
            tags: update.tags.clone(),
            created: now,
            status: NoteStatus::Active,
        },
        Some(mut note) => {
            if !update.detail.is_empty() {
                note.detail.clone_from(&update.detail);
            }
            if !update.context.is_empty() {
                note.context.clone_from(&update.context);
            }
            note.tags.extend(update.tags.iter().cloned());
            note
        }
    }
}

/// Keyword score of one note. Zero means no match.
#[must_use]
pub fn score_note(note: &MemoryNote, keywords: &[String]) -> u32 {
    let summary = note.summary.to_lowercase();
    let detail = note.detail.to_lowercase();
    let context = note.context.to_lowercase();

    let mut score = 0u32;
    for keyword in keywords {
        if summary.contains(keyword.as_str()) {
            score += 3;
        }
        if detail.contains(keyword.as_str()) {
            score += 2;
        }
        if note.kind.as_str() == keyword {
            score += 2;
        }
        if context.contains(keyword.as_str()) {
            score += 2;
        }
        if note.tags.contains(keyword) {
            score += 3;
        }
        if note.tags.iter().any(|t| t.contains(keyword.as_str())) {
            score += 1;
        }
    }
    score
}
