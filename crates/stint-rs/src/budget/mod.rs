//! Multi-dimensional episode budgets: ceilings, counters, checks, and guards.
//!
//! Every episode is metered on five dimensions: tokens, wall time, retries,
//! nested subcalls, and tool calls. This module layers the accounting:
//!
//! 1. **[`checker`]**: pure math. Given a [`BudgetConfig`], a
//!    [`BudgetState`], and a [`BudgetRequest`], decides allow/deny per
//!    dimension and derives child budgets for subcalls.
//!
//! 2. **[`tracker`]**: [`BudgetTracker`] owns one episode's live counters,
//!    including a pausable wall clock, and notifies [`BudgetObserver`]s when
//!    a dimension crosses its warning threshold or its ceiling.
//!
//! 3. **[`guard`]**: [`BudgetGuard`] wraps model calls, tool calls, and
//!    subcall forks with a check-then-record contract. Budgets are the only
//!    cancellation mechanism: a denied check means the operation never runs.
//!
//! 4. **[`events`]**: [`BudgetEvent`] notifications and observer helpers.

pub mod checker;
pub mod events;
pub mod guard;
pub mod tracker;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use checker::{
    BudgetCheck, DimensionCheck, SubBudgetOptions, check_all, check_dimension, derive_sub_budget,
};
pub use events::{BudgetEvent, BudgetObserver, FnBudgetObserver, LoggingObserver, ThresholdLevel};
pub use guard::{BudgetGuard, Metered, ModelOutcome, ModelUsage, SubcallAllocation};
pub use tracker::{BudgetTracker, Clock, ManualClock, SharedTracker, SystemClock};

/// Default fraction of a ceiling at which a warning fires.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.80;

// ── Dimensions ─────────────────────────────────────────────────────

/// One metered resource.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Tokens,
    TimeMs,
    Retries,
    Subcalls,
    ToolCalls,
}

impl BudgetDimension {
    /// All dimensions, in reporting order.
    pub const ALL: [BudgetDimension; 5] = [
        BudgetDimension::Tokens,
        BudgetDimension::TimeMs,
        BudgetDimension::Retries,
        BudgetDimension::Subcalls,
        BudgetDimension::ToolCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::Tokens => "tokens",
            BudgetDimension::TimeMs => "time_ms",
            BudgetDimension::Retries => "retries",
            BudgetDimension::Subcalls => "subcalls",
            BudgetDimension::ToolCalls => "tool_calls",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Config ─────────────────────────────────────────────────────────

/// Optional ceilings for each dimension. `None` means unbounded.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subcalls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
}

impl BudgetConfig {
    /// A budget with no ceilings at all.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_max_time_ms(mut self, max: u64) -> Self {
        self.max_time_ms = Some(max);
        self
    }

    pub fn with_max_retries(mut self, max: u64) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_max_subcalls(mut self, max: u64) -> Self {
        self.max_subcalls = Some(max);
        self
    }

    pub fn with_max_tool_calls(mut self, max: u64) -> Self {
        self.max_tool_calls = Some(max);
        self
    }

    /// The ceiling for one dimension.
    pub fn max(&self, dimension: BudgetDimension) -> Option<u64> {
        match dimension {
            BudgetDimension::Tokens => self.max_tokens,
            BudgetDimension::TimeMs => self.max_time_ms,
            BudgetDimension::Retries => self.max_retries,
            BudgetDimension::Subcalls => self.max_subcalls,
            BudgetDimension::ToolCalls => self.max_tool_calls,
        }
    }
}

// ── State ──────────────────────────────────────────────────────────

/// Consumption counters. Monotonically non-decreasing for the life of an
/// episode; a retry starts a new episode with fresh counters.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetState {
    pub tokens_used: u64,
    pub time_ms_used: u64,
    pub retries_used: u64,
    pub subcalls_used: u64,
    pub tool_calls_used: u64,
}

impl BudgetState {
    pub fn used(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens_used,
            BudgetDimension::TimeMs => self.time_ms_used,
            BudgetDimension::Retries => self.retries_used,
            BudgetDimension::Subcalls => self.subcalls_used,
            BudgetDimension::ToolCalls => self.tool_calls_used,
        }
    }

    /// Add `amount` to one counter, saturating.
    pub fn add(&mut self, dimension: BudgetDimension, amount: u64) {
        let slot = match dimension {
            BudgetDimension::Tokens => &mut self.tokens_used,
            BudgetDimension::TimeMs => &mut self.time_ms_used,
            BudgetDimension::Retries => &mut self.retries_used,
            BudgetDimension::Subcalls => &mut self.subcalls_used,
            BudgetDimension::ToolCalls => &mut self.tool_calls_used,
        };
        *slot = slot.saturating_add(amount);
    }

    /// Per-dimension maximum of two states. Merging a stale snapshot never
    /// moves a counter backwards.
    pub fn merge_max(&self, other: &BudgetState) -> BudgetState {
        BudgetState {
            tokens_used: self.tokens_used.max(other.tokens_used),
            time_ms_used: self.time_ms_used.max(other.time_ms_used),
            retries_used: self.retries_used.max(other.retries_used),
            subcalls_used: self.subcalls_used.max(other.subcalls_used),
            tool_calls_used: self.tool_calls_used.max(other.tool_calls_used),
        }
    }
}

// ── Requests ───────────────────────────────────────────────────────

/// Amounts an operation intends to consume (or actually consumed).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetRequest {
    pub tokens: u64,
    pub time_ms: u64,
    pub retries: u64,
    pub subcalls: u64,
    pub tool_calls: u64,
}

impl BudgetRequest {
    /// A request that consumes nothing. Checking it only asks whether any
    /// dimension is already over its ceiling.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn tokens(tokens: u64) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    pub fn tool_call() -> Self {
        Self {
            tool_calls: 1,
            ..Self::default()
        }
    }

    pub fn subcall() -> Self {
        Self {
            subcalls: 1,
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_time_ms(mut self, time_ms: u64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn amount(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens,
            BudgetDimension::TimeMs => self.time_ms,
            BudgetDimension::Retries => self.retries,
            BudgetDimension::Subcalls => self.subcalls,
            BudgetDimension::ToolCalls => self.tool_calls,
        }
    }
}

/// Treat a counter delta as a request for the same amounts.
impl From<BudgetState> for BudgetRequest {
    fn from(delta: BudgetState) -> Self {
        Self {
            tokens: delta.tokens_used,
            time_ms: delta.time_ms_used,
            retries: delta.retries_used,
            subcalls: delta.subcalls_used,
            tool_calls: delta.tool_calls_used,
        }
    }
}
