//! Convenience re-exports for common `stint-rs` types.
//!
//! ```ignore
//! use stint_rs::prelude::*;
//! ```
//!
//! Covers budgets, episodes, memory, and audit. Checker internals, store
//! futures, and clock implementations stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::config::StintConfig;
pub use crate::error::{BudgetExceededError, GuardError, Result, StintError};
pub use crate::json_schema_for;
pub use crate::tokens::TokenEstimator;

// ── Budgets ─────────────────────────────────────────────────────────
pub use crate::budget::{
    BudgetConfig, BudgetDimension, BudgetEvent, BudgetGuard, BudgetObserver, BudgetRequest,
    BudgetState, BudgetTracker, FnBudgetObserver, LoggingObserver, Metered, ModelOutcome,
    ModelUsage, SubBudgetOptions, SubcallAllocation, ThresholdLevel,
};

// ── Episodes ────────────────────────────────────────────────────────
pub use crate::episode::{
    Episode, EpisodeFilter, EpisodeService, EpisodeStatus, EpisodeStore, EpisodeTransition,
    FileEpisodeStore, InMemoryEpisodeStore, InMemorySessionManager, NewEpisode, Session,
    SessionManager, SubcallRequest,
};

// ── Memory ──────────────────────────────────────────────────────────
pub use crate::memory::{
    EvictionConfig, EvictionEngine, EvictionRequest, EvictionResult, EvictionStrategy,
    InMemoryMemoryStore, MemoryEntry, MemoryPriority, MemoryStore, PinRequest, PinUpdate,
    PinnedCategory, PinnedConfig, PinnedContextManager,
};

// ── Audit ───────────────────────────────────────────────────────────
pub use crate::audit::{AuditEmitter, AuditEvent, AuditKind, TracingAuditEmitter};
