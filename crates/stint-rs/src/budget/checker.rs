//! Pure budget math: per-dimension checks and subcall budget derivation.
//!
//! Nothing in this module holds state. The [`BudgetTracker`](super::BudgetTracker)
//! feeds it snapshots; the [`BudgetGuard`](super::BudgetGuard) acts on its
//! verdicts.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{BudgetConfig, BudgetDimension, BudgetRequest, BudgetState};
use crate::error::BudgetExceededError;

/// Verdict for a single dimension.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionCheck {
    pub dimension: BudgetDimension,
    pub allowed: bool,
    pub max: Option<u64>,
    pub used: u64,
    pub requested: u64,
    /// Capacity left after the request is applied. `None` when unbounded;
    /// `Some(0)` when denied.
    pub remaining: Option<u64>,
    /// How far `used + requested` overshoots the ceiling. Zero when allowed.
    pub overage: u64,
}

/// Check one dimension: allowed iff `used + requested <= max`.
pub fn check_dimension(
    dimension: BudgetDimension,
    max: Option<u64>,
    used: u64,
    requested: u64,
) -> DimensionCheck {
    let Some(max) = max else {
        return DimensionCheck {
            dimension,
            allowed: true,
            max: None,
            used,
            requested,
            remaining: None,
            overage: 0,
        };
    };

    let total = used.saturating_add(requested);
    let allowed = total <= max;
    DimensionCheck {
        dimension,
        allowed,
        max: Some(max),
        used,
        requested,
        remaining: Some(max.saturating_sub(total)),
        overage: total.saturating_sub(max),
    }
}

/// Aggregate verdict across all five dimensions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    /// Violated dimensions in [`BudgetDimension::ALL`] order.
    pub violations: Vec<BudgetDimension>,
    pub details: BTreeMap<BudgetDimension, DimensionCheck>,
}

impl BudgetCheck {
    /// Convert a denial into the error the guard raises.
    pub fn into_result(self) -> Result<(), BudgetExceededError> {
        if self.allowed {
            Ok(())
        } else {
            Err(BudgetExceededError {
                violations: self.violations,
                details: self.details,
            })
        }
    }

    pub fn detail(&self, dimension: BudgetDimension) -> Option<&DimensionCheck> {
        self.details.get(&dimension)
    }
}

/// Check every dimension of `request` against `config` and `state`.
///
/// Dimensions with a zero request are still evaluated, so a dimension that
/// is already over its ceiling denies every further operation.
pub fn check_all(config: &BudgetConfig, state: &BudgetState, request: &BudgetRequest) -> BudgetCheck {
    let mut details = BTreeMap::new();
    let mut violations = Vec::new();

    for dim in BudgetDimension::ALL {
        let check = check_dimension(dim, config.max(dim), state.used(dim), request.amount(dim));
        if !check.allowed {
            violations.push(dim);
        }
        details.insert(dim, check);
    }

    BudgetCheck {
        allowed: violations.is_empty(),
        violations,
        details,
    }
}

// ── Subcall derivation ─────────────────────────────────────────────

/// How a child budget is carved out of a parent's remaining capacity.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SubBudgetOptions {
    /// Share of the parent's remaining capacity granted to the child (0.0–1.0).
    pub fraction: f64,
    /// Minimum token ceiling for the child, clamped to the parent's remaining tokens.
    pub min_tokens: Option<u64>,
    /// Minimum wall-time ceiling for the child, clamped to the parent's remaining time.
    pub min_time_ms: Option<u64>,
}

impl Default for SubBudgetOptions {
    fn default() -> Self {
        Self {
            fraction: 0.5,
            min_tokens: None,
            min_time_ms: None,
        }
    }
}

impl SubBudgetOptions {
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction;
        self
    }

    pub fn with_min_tokens(mut self, min: u64) -> Self {
        self.min_tokens = Some(min);
        self
    }

    pub fn with_min_time_ms(mut self, min: u64) -> Self {
        self.min_time_ms = Some(min);
        self
    }

    fn clamped_fraction(&self) -> f64 {
        if self.fraction.is_finite() {
            self.fraction.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Derive a child budget from the parent's remaining capacity.
///
/// Tokens and time get `remaining * fraction`, lifted to the configured
/// minimum. Tool calls are scaled the same way; subcalls are scaled from
/// the remaining count minus one (the fork being allocated). Retries pass
/// through unscaled: the child has its own retry allowance. Unbounded parent
/// dimensions stay unbounded. No derived ceiling ever exceeds the parent's
/// remaining capacity.
pub fn derive_sub_budget(
    parent: &BudgetConfig,
    state: &BudgetState,
    options: &SubBudgetOptions,
) -> BudgetConfig {
    let fraction = options.clamped_fraction();

    let carve = |max: Option<u64>, used: u64, reserve: u64, min: Option<u64>| {
        max.map(|max| {
            let remaining = max.saturating_sub(used).saturating_sub(reserve);
            scale(remaining, fraction)
                .max(min.unwrap_or(0))
                .min(remaining)
        })
    };

    BudgetConfig {
        max_tokens: carve(parent.max_tokens, state.tokens_used, 0, options.min_tokens),
        max_time_ms: carve(parent.max_time_ms, state.time_ms_used, 0, options.min_time_ms),
        max_retries: parent.max_retries,
        max_subcalls: carve(parent.max_subcalls, state.subcalls_used, 1, None),
        max_tool_calls: carve(parent.max_tool_calls, state.tool_calls_used, 0, None),
    }
}

fn scale(remaining: u64, fraction: f64) -> u64 {
    let scaled = (remaining as f64 * fraction).floor() as u64;
    scaled.min(remaining)
}
