//! Error taxonomy for episodes, budgets, and memory.
//!
//! Every fallible operation in the crate returns [`StintError`] (via the
//! [`Result`] alias), except guarded operations which return
//! [`GuardError`] so the caller's own error type survives the guard
//! untouched. Nothing here is retried implicitly: errors surface to the
//! caller, and retries are an explicit, budget-accounted action.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::budget::{BudgetDimension, DimensionCheck};
use crate::episode::{EpisodeStatus, EpisodeTransition};

/// Crate-wide result alias.
pub type Result<T, E = StintError> = std::result::Result<T, E>;

/// A budget check denied an operation.
///
/// Carries the violated dimensions (in [`BudgetDimension::ALL`] order) and
/// the per-dimension detail for every dimension that was evaluated.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("budget exceeded on {}", join_dimensions(.violations))]
pub struct BudgetExceededError {
    pub violations: Vec<BudgetDimension>,
    pub details: BTreeMap<BudgetDimension, DimensionCheck>,
}

impl BudgetExceededError {
    /// Whether `dimension` is among the violations.
    pub fn violated(&self, dimension: BudgetDimension) -> bool {
        self.violations.contains(&dimension)
    }
}

fn join_dimensions(dims: &[BudgetDimension]) -> String {
    dims.iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by the episode, budget, and memory components.
#[derive(Debug, Error)]
pub enum StintError {
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceededError),

    /// The requested operation is not an edge of the episode state graph.
    #[error("invalid episode transition: cannot {requested} an episode in state {from}")]
    InvalidTransition {
        from: EpisodeStatus,
        requested: EpisodeTransition,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("retries exhausted for episode {episode_id}: {used} of {max} used")]
    RetriesExhausted {
        episode_id: String,
        used: u64,
        max: u64,
    },

    /// A pin (or content update) would push the tenant past its pinned budget.
    #[error(
        "pinned budget exceeded for tenant {tenant_id}: {used} used + {requested} requested > {budget} budget"
    )]
    PinnedBudgetExceeded {
        tenant_id: String,
        requested: u64,
        used: u64,
        budget: u64,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A collaborator store failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StintError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Error from a guarded operation: either the guard refused it, or the
/// operation itself failed.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Budget(#[from] BudgetExceededError),
    #[error("guarded operation failed: {0}")]
    Operation(E),
}

impl<E> GuardError<E> {
    pub fn is_budget(&self) -> bool {
        matches!(self, GuardError::Budget(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            GuardError::Operation(e) => Some(e),
            GuardError::Budget(_) => None,
        }
    }
}

impl From<GuardError<StintError>> for StintError {
    fn from(err: GuardError<StintError>) -> Self {
        match err {
            GuardError::Budget(b) => StintError::BudgetExceeded(b),
            GuardError::Operation(e) => e,
        }
    }
}
