//! Threshold notifications emitted by a [`BudgetTracker`](super::BudgetTracker).
//!
//! A tracker fires at most one [`BudgetEvent::Warning`] and one
//! [`BudgetEvent::Exceeded`] per dimension: it remembers the last level
//! crossed and stays quiet until that dimension's notifications are reset.
//!
//! | Observer | Use case |
//! |----------|----------|
//! | [`LoggingObserver`] | Structured logging via `tracing` |
//! | [`FnBudgetObserver`] | Quick closures (tests, metrics counters) |
//! | Custom `impl BudgetObserver` | Anything else |

use serde::Serialize;
use tracing::warn;

use super::BudgetDimension;

/// Severity of a threshold crossing. Ordered: `Warning < Exceeded`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    Warning,
    Exceeded,
}

/// A dimension crossed a threshold.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetEvent {
    /// Usage reached the warning threshold (default 80%) of the ceiling.
    Warning {
        episode_id: String,
        dimension: BudgetDimension,
        used: u64,
        max: u64,
        fraction: f64,
    },
    /// Usage reached the ceiling. Nothing more of this dimension fits, even
    /// though the ceiling itself was not overrun.
    Exceeded {
        episode_id: String,
        dimension: BudgetDimension,
        used: u64,
        max: u64,
    },
}

impl BudgetEvent {
    pub fn dimension(&self) -> BudgetDimension {
        match self {
            BudgetEvent::Warning { dimension, .. } | BudgetEvent::Exceeded { dimension, .. } => {
                *dimension
            }
        }
    }

    pub fn level(&self) -> ThresholdLevel {
        match self {
            BudgetEvent::Warning { .. } => ThresholdLevel::Warning,
            BudgetEvent::Exceeded { .. } => ThresholdLevel::Exceeded,
        }
    }
}

/// Receives threshold notifications from a tracker.
pub trait BudgetObserver: Send + Sync {
    fn on_budget_event(&self, event: &BudgetEvent);
}

/// Logs every notification at WARN.
pub struct LoggingObserver;

impl BudgetObserver for LoggingObserver {
    fn on_budget_event(&self, event: &BudgetEvent) {
        match event {
            BudgetEvent::Warning {
                episode_id,
                dimension,
                used,
                max,
                fraction,
            } => {
                warn!(
                    "[{episode_id}] {dimension} at {:.0}% of budget ({used}/{max})",
                    fraction * 100.0
                );
            }
            BudgetEvent::Exceeded {
                episode_id,
                dimension,
                used,
                max,
            } => {
                warn!("[{episode_id}] {dimension} budget exhausted ({used}/{max})");
            }
        }
    }
}

/// A budget observer backed by a closure.
///
/// ```ignore
/// let warnings = Arc::new(AtomicUsize::new(0));
/// let w = warnings.clone();
/// tracker.subscribe(Arc::new(FnBudgetObserver::new(move |event| {
///     if event.level() == ThresholdLevel::Warning {
///         w.fetch_add(1, Ordering::SeqCst);
///     }
/// })));
/// ```
pub struct FnBudgetObserver<F>(F)
where
    F: Fn(&BudgetEvent) + Send + Sync;

impl<F> FnBudgetObserver<F>
where
    F: Fn(&BudgetEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> BudgetObserver for FnBudgetObserver<F>
where
    F: Fn(&BudgetEvent) + Send + Sync,
{
    fn on_budget_event(&self, event: &BudgetEvent) {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(ThresholdLevel::Warning < ThresholdLevel::Exceeded);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = BudgetEvent::Exceeded {
            episode_id: "ep-1".into(),
            dimension: BudgetDimension::ToolCalls,
            used: 5,
            max: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exceeded");
        assert_eq!(json["dimension"], "tool_calls");
        assert_eq!(event.level(), ThresholdLevel::Exceeded);
        assert_eq!(event.dimension(), BudgetDimension::ToolCalls);
    }

    #[test]
    fn fn_observer_invokes_closure() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = AtomicUsize::new(0);
        let observer = FnBudgetObserver::new(|_e: &BudgetEvent| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        observer.on_budget_event(&BudgetEvent::Warning {
            episode_id: "ep".into(),
            dimension: BudgetDimension::Tokens,
            used: 80,
            max: 100,
            fraction: 0.8,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
