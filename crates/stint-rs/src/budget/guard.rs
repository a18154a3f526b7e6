//! Check-then-record wrappers around metered operations.
//!
//! A [`BudgetGuard`] is handed to whatever runs inside an episode. Every
//! model call, tool call, and subcall fork goes through it: the tracker is
//! checked first, the operation runs only if the check passes, and usage is
//! recorded afterwards. The tracker lock is never held while the operation
//! is awaited.

use std::future::Future;
use std::sync::MutexGuard;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::checker::{BudgetCheck, SubBudgetOptions, derive_sub_budget};
use super::tracker::{BudgetTracker, SharedTracker};
use super::{BudgetConfig, BudgetRequest};
use crate::error::{BudgetExceededError, GuardError};
use crate::tokens::TokenEstimator;

/// Result of a [`BudgetGuard::with_check`] operation, optionally carrying
/// the usage it actually incurred.
#[derive(Debug, Clone, PartialEq)]
pub struct Metered<T> {
    pub value: T,
    /// Actual usage. When `None` the estimate is recorded instead.
    pub actual: Option<BudgetRequest>,
}

impl<T> Metered<T> {
    /// Record the estimate.
    pub fn estimated(value: T) -> Self {
        Self {
            value,
            actual: None,
        }
    }

    pub fn actual(value: T, usage: BudgetRequest) -> Self {
        Self {
            value,
            actual: Some(usage),
        }
    }
}

/// Token usage reported by a model provider.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ModelUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Result of a guarded model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutcome<T> {
    pub value: T,
    pub usage: Option<ModelUsage>,
}

impl<T> ModelOutcome<T> {
    /// An outcome without provider usage; the estimate is recorded.
    pub fn new(value: T) -> Self {
        Self { value, usage: None }
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Request for a child budget at fork time.
#[derive(Debug, Clone, PartialEq)]
pub struct SubcallAllocation {
    pub child_id: String,
    pub options: SubBudgetOptions,
}

impl SubcallAllocation {
    pub fn new(child_id: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            options: SubBudgetOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SubBudgetOptions) -> Self {
        self.options = options;
        self
    }
}

/// Enforces a tracker's budget around individual operations.
#[derive(Debug, Clone)]
pub struct BudgetGuard {
    tracker: SharedTracker,
    estimator: TokenEstimator,
}

impl BudgetGuard {
    pub fn new(tracker: SharedTracker) -> Self {
        Self {
            tracker,
            estimator: TokenEstimator::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    fn lock(&self) -> MutexGuard<'_, BudgetTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-only check against the tracker.
    pub fn check(&self, request: &BudgetRequest) -> BudgetCheck {
        self.lock().check_before(request)
    }

    fn precheck(&self, request: &BudgetRequest) -> Result<(), BudgetExceededError> {
        let check = self.check(request);
        if !check.allowed {
            warn!(
                "[{}] budget denied: {:?}",
                self.lock().episode_id(),
                check.violations
            );
        }
        check.into_result()
    }

    /// Run `operation` if `estimate` fits, then record its actual usage (or
    /// the estimate when it reports none). A failed operation records nothing.
    pub async fn with_check<T, E, F, Fut>(
        &self,
        estimate: BudgetRequest,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Metered<T>, E>>,
    {
        self.precheck(&estimate)?;
        let metered = operation().await.map_err(GuardError::Operation)?;
        let usage = metered.actual.unwrap_or(estimate);
        self.lock().record_usage(&usage);
        Ok(metered.value)
    }

    /// Guard a model call.
    ///
    /// The pre-check estimates `prompt` plus `max_output_tokens`. Afterwards
    /// the provider-reported input+output tokens are recorded against
    /// `model`, or the estimate if the provider reported nothing.
    pub async fn guard_model_call<T, E, F, Fut>(
        &self,
        model: &str,
        prompt: &str,
        max_output_tokens: u64,
        call: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ModelOutcome<T>, E>>,
    {
        let estimate = self
            .estimator
            .estimate(prompt)
            .saturating_add(max_output_tokens);
        self.precheck(&BudgetRequest::tokens(estimate))?;

        let outcome = call().await.map_err(GuardError::Operation)?;
        let tokens = outcome.usage.map_or(estimate, |u| u.total());
        debug!("model {model}: {tokens} tokens (estimate {estimate})");
        self.lock().record_model_tokens(model, tokens);
        Ok(outcome.value)
    }

    /// Guard a tool call. The call is recorded whether it succeeds or fails.
    pub async fn guard_tool_call<T, E, F, Fut>(
        &self,
        name: &str,
        call: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.precheck(&BudgetRequest::tool_call())?;
        let result = call().await;
        self.lock().record_tool_call(name);
        result.map_err(GuardError::Operation)
    }

    /// Carve a child budget out of the parent's remaining capacity and
    /// record the fork. Check, derivation, and record happen under one lock.
    pub fn allocate_subcall_budget(
        &self,
        allocation: &SubcallAllocation,
    ) -> Result<BudgetConfig, BudgetExceededError> {
        let mut tracker = self.lock();
        tracker
            .check_before(&BudgetRequest::subcall())
            .into_result()?;
        let child =
            derive_sub_budget(tracker.config(), &tracker.snapshot(), &allocation.options);
        tracker.record_subcall(&allocation.child_id);
        debug!(
            "[{}] allocated subcall budget for {}: {child:?}",
            tracker.episode_id(),
            allocation.child_id
        );
        Ok(child)
    }

    /// Undo [`allocate_subcall_budget`](Self::allocate_subcall_budget) for a
    /// child that could not be created.
    pub fn release_subcall_budget(&self, allocation: &SubcallAllocation) {
        self.lock().release_subcall(&allocation.child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetDimension, BudgetState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn guard(config: BudgetConfig) -> BudgetGuard {
        BudgetGuard::new(BudgetTracker::new("ep", config).into_shared())
            .with_estimator(TokenEstimator::from_fn(|s| s.len() as u64))
    }

    #[tokio::test]
    async fn denied_operation_is_never_invoked() {
        let g = guard(BudgetConfig::unbounded().with_max_tokens(10));
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let result: Result<(), GuardError<String>> = g
            .with_check(BudgetRequest::tokens(11), || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Metered::estimated(()))
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_budget());
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(g.tracker().lock().unwrap().snapshot().tokens_used, 0);
    }

    #[tokio::test]
    async fn actual_usage_preferred_over_estimate() {
        let g = guard(BudgetConfig::unbounded().with_max_tokens(100));
        let value: Result<u32, GuardError<String>> = g
            .with_check(BudgetRequest::tokens(50), || async {
                Ok(Metered::actual(7, BudgetRequest::tokens(12)))
            })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(g.tracker().lock().unwrap().snapshot().tokens_used, 12);

        let _: Result<(), GuardError<String>> = g
            .with_check(BudgetRequest::tokens(5), || async { Ok(Metered::estimated(())) })
            .await;
        assert_eq!(g.tracker().lock().unwrap().snapshot().tokens_used, 17);
    }

    #[tokio::test]
    async fn model_call_records_reported_usage_by_model() {
        let g = guard(BudgetConfig::unbounded().with_max_tokens(1_000));
        let text: Result<String, GuardError<String>> = g
            .guard_model_call("model-a", "hello", 100, || async {
                Ok(ModelOutcome::new("hi".to_string()).with_usage(ModelUsage {
                    input_tokens: 5,
                    output_tokens: 2,
                }))
            })
            .await;
        assert_eq!(text.unwrap(), "hi");
        let tracker = g.tracker().lock().unwrap();
        assert_eq!(tracker.snapshot().tokens_used, 7);
        assert_eq!(tracker.tokens_by_model()["model-a"], 7);
    }

    #[tokio::test]
    async fn model_call_without_usage_records_estimate() {
        let g = guard(BudgetConfig::unbounded());
        let _: Result<(), GuardError<String>> = g
            .guard_model_call("m", "abcd", 10, || async { Ok(ModelOutcome::new(())) })
            .await;
        assert_eq!(g.tracker().lock().unwrap().snapshot().tokens_used, 14);
    }

    #[tokio::test]
    async fn model_call_estimate_counts_output_reservation() {
        let g = guard(BudgetConfig::unbounded().with_max_tokens(50));
        let result: Result<(), GuardError<String>> = g
            .guard_model_call("m", "abcd", 100, || async { Ok(ModelOutcome::new(())) })
            .await;
        match result {
            Err(GuardError::Budget(e)) => assert!(e.violated(BudgetDimension::Tokens)),
            other => panic!("expected budget error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_tool_call_is_still_recorded() {
        let g = guard(BudgetConfig::unbounded().with_max_tool_calls(2));
        let failed: Result<(), GuardError<String>> = g
            .guard_tool_call("flaky", || async { Err("boom".to_string()) })
            .await;
        assert_eq!(failed.unwrap_err().into_operation().as_deref(), Some("boom"));

        let ok: Result<u8, GuardError<String>> =
            g.guard_tool_call("flaky", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let denied: Result<u8, GuardError<String>> =
            g.guard_tool_call("flaky", || async { Ok(1) }).await;
        assert!(denied.unwrap_err().is_budget());
        assert_eq!(g.tracker().lock().unwrap().tool_calls_by_name()["flaky"], 2);
    }

    #[test]
    fn subcall_allocation_derives_and_records() {
        let tracker = BudgetTracker::new(
            "parent",
            BudgetConfig::unbounded()
                .with_max_tokens(1_000)
                .with_max_subcalls(2),
        )
        .with_initial_state(BudgetState {
            tokens_used: 200,
            ..Default::default()
        });
        let g = BudgetGuard::new(tracker.into_shared());

        let child = g
            .allocate_subcall_budget(&SubcallAllocation::new("c1"))
            .unwrap();
        assert_eq!(child.max_tokens, Some(400));
        assert_eq!(child.max_subcalls, Some(0));

        g.allocate_subcall_budget(&SubcallAllocation::new("c2"))
            .unwrap();
        let err = g
            .allocate_subcall_budget(&SubcallAllocation::new("c3"))
            .unwrap_err();
        assert!(err.violated(BudgetDimension::Subcalls));
        assert_eq!(
            g.tracker().lock().unwrap().subcall_children(),
            ["c1".to_string(), "c2".to_string()]
        );
    }

    #[test]
    fn released_subcall_frees_its_slot() {
        let g = guard(BudgetConfig {
            max_subcalls: Some(1),
            ..Default::default()
        });
        let first = SubcallAllocation::new("c1");
        g.allocate_subcall_budget(&first).unwrap();
        g.release_subcall_budget(&first);
        g.release_subcall_budget(&first);

        {
            let tracker = g.tracker().lock().unwrap();
            assert_eq!(tracker.snapshot().subcalls_used, 0);
            assert!(tracker.subcall_children().is_empty());
        }
        g.allocate_subcall_budget(&SubcallAllocation::new("c2"))
            .unwrap();
    }
}
