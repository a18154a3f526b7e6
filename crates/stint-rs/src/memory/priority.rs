//! Four-tier priority model and the eviction score.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::episode::Metadata;

/// Score assigned to pinned entries. Never the lowest score in any sweep.
pub const PINNED_EVICTION_SCORE: f64 = f64::MAX;

/// Recency half-life, in hours.
pub const RECENCY_HALF_LIFE_HOURS: f64 = 24.0;

/// Priority tier, highest first: `Pinned > Session > Sliding > Ephemeral`.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPriority {
    Ephemeral,
    Sliding,
    Session,
    Pinned,
}

impl MemoryPriority {
    /// Tier weight used by the eviction score.
    pub fn weight(&self) -> f64 {
        match self {
            MemoryPriority::Pinned => 1000.0,
            MemoryPriority::Session => 100.0,
            MemoryPriority::Sliding => 10.0,
            MemoryPriority::Ephemeral => 1.0,
        }
    }

    /// Pinned never; session only while no session is active.
    pub fn is_evictable(&self, session_active: bool) -> bool {
        match self {
            MemoryPriority::Pinned => false,
            MemoryPriority::Session => !session_active,
            MemoryPriority::Sliding | MemoryPriority::Ephemeral => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPriority::Pinned => "pinned",
            MemoryPriority::Session => "session",
            MemoryPriority::Sliding => "sliding",
            MemoryPriority::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for MemoryPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `weight × 0.5^(hours_since_access / 24) × (log2(access_count + 1) + 1)`.
///
/// Lower scores are evicted first within a tier. Pinned entries always score
/// [`PINNED_EVICTION_SCORE`]. Access times in the future count as zero age.
pub fn eviction_score(
    priority: MemoryPriority,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    now: DateTime<Utc>,
) -> f64 {
    if priority == MemoryPriority::Pinned {
        return PINNED_EVICTION_SCORE;
    }
    let age_ms = (now - last_accessed).num_milliseconds().max(0);
    let hours = age_ms as f64 / 3_600_000.0;
    let recency = 0.5f64.powf(hours / RECENCY_HALF_LIFE_HOURS);
    let access = ((access_count as f64) + 1.0).log2() + 1.0;
    priority.weight() * recency * access
}

/// Category and display label of a pinned entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PinInfo {
    pub category: super::pinned::PinnedCategory,
    pub label: String,
}

/// One unit of agent memory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub tenant_id: String,
    pub priority: MemoryPriority,
    pub size_tokens: u64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub eviction_score: f64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Present only on pinned entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<PinInfo>,
}

impl MemoryEntry {
    /// A fresh entry created at `now`, never accessed.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        priority: MemoryPriority,
        size_tokens: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            priority,
            size_tokens,
            access_count: 0,
            last_accessed: now,
            created_at: now,
            eviction_score: eviction_score(priority, now, 0, now),
            content: String::new(),
            metadata: Metadata::new(),
            pin: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_access(mut self, access_count: u64, last_accessed: DateTime<Utc>) -> Self {
        self.access_count = access_count;
        self.last_accessed = last_accessed;
        self.eviction_score =
            eviction_score(self.priority, last_accessed, access_count, last_accessed);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_pinned(&self) -> bool {
        self.priority == MemoryPriority::Pinned
    }

    /// Score as of `now`.
    pub fn score_at(&self, now: DateTime<Utc>) -> f64 {
        eviction_score(self.priority, self.last_accessed, self.access_count, now)
    }

    /// Record an access: bump the count, move last-access to `now`, and
    /// recompute the stored score. The tier is never changed.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = now;
        self.eviction_score = self.score_at(now);
    }
}
