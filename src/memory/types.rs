//! Core memory type definitions.
//!
//! Defines [`Tier`] (the three retention classes), [`MemoryContext`] (what a
//! memory is for), [`MetadataValue`] (the primitive-only metadata value), and
//! [`Memory`] (a full record as held by the relational backend).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retention class of a memory. Ordered hottest to coldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Freshly captured memories for the task at hand.
    Working,
    /// Memories relevant for the current session or day.
    Session,
    /// Durable knowledge. Terminal tier.
    LongTerm,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Working, Tier::Session, Tier::LongTerm];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Session => "session",
            Self::LongTerm => "long_term",
        }
    }

    /// The tier a memory moves to on migration. `None` for the terminal tier.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Self::Working => Some(Self::Session),
            Self::Session => Some(Self::LongTerm),
            Self::LongTerm => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "session" => Ok(Self::Session),
            "long_term" | "longTerm" => Ok(Self::LongTerm),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// What a memory is for. Drives part of the importance heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryContext {
    CodeSnippet,
    Preference,
    Decision,
    CriticalTask,
    Conversation,
    Documentation,
    General,
}

impl MemoryContext {
    pub const ALL: [MemoryContext; 7] = [
        MemoryContext::CodeSnippet,
        MemoryContext::Preference,
        MemoryContext::Decision,
        MemoryContext::CriticalTask,
        MemoryContext::Conversation,
        MemoryContext::Documentation,
        MemoryContext::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeSnippet => "code_snippet",
            Self::Preference => "preference",
            Self::Decision => "decision",
            Self::CriticalTask => "critical_task",
            Self::Conversation => "conversation",
            Self::Documentation => "documentation",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown memory context: {s}"))
    }
}

/// A metadata value that may cross the storage boundary.
///
/// Arrays and objects never appear here; see [`crate::memory::metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    Null,
}

impl MetadataValue {
    /// Text form used by the indexed `memory_metadata` table.
    pub fn as_index_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
            Self::Null => "null".to_string(),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Sanitized metadata. Ordered so serialized rows are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key. Immutable.
    pub id: String,
    /// Text body, 1..=100,000 characters.
    pub content: String,
    pub context: MemoryContext,
    /// How critical the memory is to retain, in `[0.0, 1.0]`.
    pub importance: f64,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    /// Equals `created_at` until the first read.
    pub last_accessed_at: DateTime<Utc>,
    /// Incremented on every successful read. Advisory.
    pub access_count: u32,
    pub metadata: Metadata,
}

impl Memory {
    /// Age relative to `now`, never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Time since the last read relative to `now`, never negative.
    pub fn idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_accessed_at).max(chrono::Duration::zero())
    }

    /// Short single-line preview for reports.
    pub fn preview(&self, max_chars: usize) -> String {
        truncate_preview(&self.content.replace('\n', " "), max_chars)
    }
}

/// Canonical timestamp text: RFC 3339, millisecond precision, `Z` suffix.
///
/// Fixed width so that lexical order in SQL equals chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Truncate content to max_chars, appending "..." if truncated.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((end, _)) => format!("{}...", &content[..end]),
    }
}
