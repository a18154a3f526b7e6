//! Budget-metered agent episodes and priority-tiered memory eviction.
//!
//! `stint-rs` gives an agent runtime two things it otherwise has to invent
//! for itself: a hard ceiling on how much work one unit of agent activity
//! may do, and a memory store that sheds low-value context under pressure
//! without ever dropping what the tenant pinned.
//!
//! An [`Episode`](episode::Episode) is one bounded unit of agent work. It
//! carries a five-dimension [`BudgetConfig`](budget::BudgetConfig) (tokens,
//! wall time, retries, subcalls, tool calls) and moves through a small
//! lifecycle graph driven by [`EpisodeService`](episode::EpisodeService).
//! While it runs, every model call, tool call, and subcall fork goes through
//! a [`BudgetGuard`](budget::BudgetGuard): check first, then record.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use stint_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StintError> {
//!     let config = StintConfig::default()
//!         .with_default_budget(BudgetConfig::unbounded().with_max_tokens(10_000));
//!
//!     let service = config.build_episode_service(
//!         Arc::new(InMemoryEpisodeStore::new()),
//!         Arc::new(config.build_session_manager()),
//!         Arc::new(TracingAuditEmitter),
//!     );
//!
//!     let episode = service
//!         .create_episode(NewEpisode::new("planner", "summarize", "acme"))
//!         .await?;
//!     service.start(&episode.id).await?;
//!
//!     let guard = service.guard(&episode.id).await?;
//!     let reply: String = guard
//!         .guard_model_call("small-model", "Summarize the ticket.", 256, || async {
//!             Ok::<_, StintError>(ModelOutcome::new("done".to_string()))
//!         })
//!         .await?;
//!
//!     service.complete(&episode.id, serde_json::json!({ "reply": reply })).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Budgets:** [`budget::checker`] holds the pure allow/deny math and
//!   sub-budget derivation, [`BudgetTracker`](budget::BudgetTracker) the
//!   live counters and threshold notifications, and
//!   [`BudgetGuard`](budget::BudgetGuard) the check-then-record wrappers.
//!
//! - **Episodes:** [`episode::state`] is the lifecycle graph,
//!   [`EpisodeService`](episode::EpisodeService) the operations on it, and
//!   [`episode::store`] the persistence trait with in-memory and file-backed
//!   implementations.
//!
//! - **Memory:** [`MemoryPriority`](memory::MemoryPriority) tiers and
//!   scoring live in [`memory::priority`], sweeps in
//!   [`EvictionEngine`](memory::EvictionEngine), and the tenant-curated
//!   pinned tier in [`PinnedContextManager`](memory::PinnedContextManager).
//!
//! - **Observability:** every state change emits an
//!   [`AuditEvent`](audit::AuditEvent) through an
//!   [`AuditEmitter`](audit::AuditEmitter); budget thresholds go to
//!   [`BudgetObserver`](budget::BudgetObserver)s.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`budget`] | Ceilings, counters, checks, guards, threshold events |
//! | [`episode`] | Episode records, lifecycle, sessions, stores, service |
//! | [`memory`] | Priority tiers, memory store, eviction, pinned context |
//! | [`audit`] | Audit events and emitters |
//! | [`config`] | JSON configuration, validation, component builders |

pub mod audit;
pub mod budget;
pub mod config;
pub mod episode;
pub mod error;
pub mod ids;
pub mod memory;
pub mod prelude;
pub mod tokens;

use schemars::JsonSchema;

pub use config::StintConfig;
pub use error::{BudgetExceededError, GuardError, Result, StintError};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` for a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use stint_rs::json_schema_for;
/// use stint_rs::budget::BudgetConfig;
///
/// let schema = json_schema_for::<BudgetConfig>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["properties"].get("max_tokens").is_some());
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}
