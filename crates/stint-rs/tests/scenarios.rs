//! End-to-end behavior across budgets, episodes, and memory.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use serde_json::json;
use stint_rs::audit::{NoopAuditEmitter, RecordingAuditEmitter};
use stint_rs::memory::StoreFuture;
use stint_rs::prelude::*;

fn entry(id: &str, priority: MemoryPriority, size: u64) -> MemoryEntry {
    MemoryEntry::new(id, "tenant", priority, size, Utc::now())
}

async fn store_with(entries: Vec<MemoryEntry>) -> Arc<InMemoryMemoryStore> {
    let store = Arc::new(InMemoryMemoryStore::new());
    for e in entries {
        store.insert(e).await.unwrap();
    }
    store
}

fn engine(store: Arc<dyn MemoryStore>) -> EvictionEngine {
    EvictionEngine::new(store, Arc::new(NoopAuditEmitter))
}

fn service() -> (EpisodeService, Arc<RecordingAuditEmitter>) {
    let audit = Arc::new(RecordingAuditEmitter::new());
    let service = EpisodeService::new(
        Arc::new(InMemoryEpisodeStore::new()),
        Arc::new(InMemorySessionManager::new()),
        audit.clone(),
    );
    (service, audit)
}

// ── Memory ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pinned_content_survives_an_unmeetable_target() {
    let store = store_with(vec![
        entry("pinned", MemoryPriority::Pinned, 1000),
        entry("sliding", MemoryPriority::Sliding, 100),
    ])
    .await;
    let engine = engine(store.clone());

    let result = engine.evict(&EvictionRequest::tokens(500)).await.unwrap();

    assert_eq!(result.evicted_ids, vec!["sliding".to_string()]);
    assert_eq!(result.freed_tokens, 100);
    assert!(result.insufficient_evictable);
    assert_eq!(result.skipped_pinned, 1);
    assert!(store.get("pinned").await.unwrap().is_some());
}

#[tokio::test]
async fn sweep_stops_once_target_is_met() {
    let store = store_with(
        (0..4)
            .map(|i| entry(&format!("eph-{i}"), MemoryPriority::Ephemeral, 100))
            .collect(),
    )
    .await;
    let engine = engine(store.clone());

    let result = engine.evict(&EvictionRequest::tokens(250)).await.unwrap();

    assert_eq!(result.evicted_count(), 3);
    assert_eq!(result.freed_tokens, 300);
    assert!(!result.insufficient_evictable);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn pinned_budget_rejects_overflow() {
    let store: Arc<dyn MemoryStore> = Arc::new(InMemoryMemoryStore::new());
    let manager = PinnedContextManager::new(store.clone())
        .with_estimator(TokenEstimator::from_fn(|s| s.len() as u64));

    manager
        .pin(PinRequest::new(
            "tenant",
            PinnedCategory::BrandVoice,
            "Voice",
            "x".repeat(1750),
        ))
        .await
        .unwrap();

    let err = manager
        .pin(PinRequest::new(
            "tenant",
            PinnedCategory::ComplianceRules,
            "Rules",
            "y".repeat(500),
        ))
        .await
        .unwrap_err();
    match err {
        StintError::PinnedBudgetExceeded {
            requested,
            used,
            budget,
            ..
        } => {
            assert_eq!(requested, 500);
            assert_eq!(used, 1750);
            assert_eq!(budget, 2000);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.pinned_size("tenant").await.unwrap(), 1750);
}

/// Delays every snapshot read by one scheduler turn so two sweeps overlap.
#[derive(Default)]
struct SlowStore {
    inner: InMemoryMemoryStore,
}

impl MemoryStore for SlowStore {
    fn insert(&self, entry: MemoryEntry) -> StoreFuture<'_, ()> {
        self.inner.insert(entry)
    }

    fn fetch_evictable(&self, tenant_id: Option<&str>) -> StoreFuture<'_, Vec<MemoryEntry>> {
        let fetch = self.inner.fetch_evictable(tenant_id);
        Box::pin(async move {
            tokio::task::yield_now().await;
            fetch.await
        })
    }

    fn delete_batch(&self, ids: &[String]) -> StoreFuture<'_, usize> {
        self.inner.delete_batch(ids)
    }

    fn count(&self) -> StoreFuture<'_, u64> {
        self.inner.count()
    }

    fn total_size(&self) -> StoreFuture<'_, u64> {
        self.inner.total_size()
    }

    fn pinned_size(&self, tenant_id: &str) -> StoreFuture<'_, u64> {
        self.inner.pinned_size(tenant_id)
    }

    fn fetch_pinned(&self, tenant_id: &str) -> StoreFuture<'_, Vec<MemoryEntry>> {
        self.inner.fetch_pinned(tenant_id)
    }

    fn get(&self, id: &str) -> StoreFuture<'_, Option<MemoryEntry>> {
        self.inner.get(id)
    }

    fn update(&self, entry: MemoryEntry) -> StoreFuture<'_, ()> {
        self.inner.update(entry)
    }
}

#[tokio::test]
async fn concurrent_sweeps_never_double_evict() {
    let store = Arc::new(SlowStore::default());
    for i in 0..6 {
        store
            .insert(entry(&format!("eph-{i}"), MemoryPriority::Ephemeral, 50))
            .await
            .unwrap();
    }
    let engine = engine(store.clone());
    let request = EvictionRequest::tokens(200);

    let (a, b) = futures::join!(engine.evict(&request), engine.evict(&request));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.contended != b.contended, "exactly one sweep should run");
    let ran = if a.contended { &b } else { &a };
    let skipped = if a.contended { &a } else { &b };
    assert_eq!(ran.evicted_count(), 4);
    assert!(skipped.evicted_ids.is_empty());

    let unique: HashSet<&String> = a.evicted_ids.iter().chain(&b.evicted_ids).collect();
    assert_eq!(unique.len(), a.evicted_count() + b.evicted_count());
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn no_strategy_or_target_evicts_pinned_entries() {
    let strategies = [
        EvictionStrategy::Lru,
        EvictionStrategy::Lfu,
        EvictionStrategy::Fifo,
        EvictionStrategy::Weighted,
    ];
    for strategy in strategies {
        for target in [0, 1, 150, 10_000] {
            for session_active in [true, false] {
                let store = store_with(vec![
                    entry("p1", MemoryPriority::Pinned, 40),
                    entry("p2", MemoryPriority::Pinned, 60),
                    entry("e1", MemoryPriority::Ephemeral, 30),
                    entry("s1", MemoryPriority::Sliding, 70),
                    entry("x1", MemoryPriority::Session, 90),
                ])
                .await;
                let engine = engine(store.clone())
                    .with_config(EvictionConfig::default().with_strategy(strategy));
                let request =
                    EvictionRequest::tokens(target).with_session_active(session_active);
                let result = engine.evict(&request).await.unwrap();

                assert!(
                    !result.evicted_ids.iter().any(|id| id.starts_with('p')),
                    "{strategy:?} evicted a pinned entry for target {target}"
                );
                assert_eq!(store.pinned_size("tenant").await.unwrap(), 100);
                if session_active {
                    assert!(!result.evicted_ids.contains(&"x1".to_string()));
                }
            }
        }
    }
}

#[tokio::test]
async fn auto_evict_relieves_token_pressure_with_headroom() {
    let store = store_with(
        (0..10)
            .map(|i| entry(&format!("eph-{i}"), MemoryPriority::Ephemeral, 20))
            .collect(),
    )
    .await;
    let engine = engine(store.clone())
        .with_config(EvictionConfig::default().with_max_total_tokens(150));

    let report = engine.needs_eviction().await.unwrap();
    assert!(report.needed);
    // 50 over, plus 15 headroom.
    assert_eq!(report.token_target, Some(65));

    let result = engine.auto_evict(true).await.unwrap().unwrap();
    assert_eq!(result.freed_tokens, 80);
    assert!(store.total_size().await.unwrap() <= 150);
    assert!(engine.auto_evict(true).await.unwrap().is_none());
}

// ── Budgets ────────────────────────────────────────────────────────

#[test]
fn warning_fires_once_at_eighty_percent() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let seen = warnings.clone();
    let mut tracker = BudgetTracker::new("ep", BudgetConfig::unbounded().with_max_tokens(1000))
        .with_observer(Arc::new(FnBudgetObserver::new(move |event: &BudgetEvent| {
            if event.level() == ThresholdLevel::Warning {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })));

    tracker.record_tokens(799);
    assert_eq!(warnings.load(Ordering::SeqCst), 0);
    tracker.record_tokens(1);
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
    tracker.record_tokens(50);
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
}

// ── Episodes ───────────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_with_guarded_work() {
    let (service, audit) = service();
    let episode = service
        .create_episode(
            NewEpisode::new("agent", "research", "tenant")
                .with_input(json!({"q": "why"}))
                .with_budget(
                    BudgetConfig::unbounded()
                        .with_max_tokens(1000)
                        .with_max_tool_calls(2),
                ),
        )
        .await
        .unwrap();

    let early = service.complete(&episode.id, json!("too soon")).await;
    assert!(matches!(
        early,
        Err(StintError::InvalidTransition {
            from: EpisodeStatus::Created,
            requested: EpisodeTransition::Complete,
        })
    ));

    service.start(&episode.id).await.unwrap();
    let guard = service.guard(&episode.id).await.unwrap();
    guard
        .guard_model_call("m", "prompt", 100, || async {
            Ok::<_, StintError>(ModelOutcome::new(()).with_usage(ModelUsage {
                input_tokens: 40,
                output_tokens: 60,
            }))
        })
        .await
        .unwrap();
    for _ in 0..2 {
        guard
            .guard_tool_call("lookup", || async { Ok::<_, StintError>(()) })
            .await
            .unwrap();
    }
    let denied = guard
        .guard_tool_call("lookup", || async { Ok::<_, StintError>(()) })
        .await;
    assert!(matches!(denied, Err(GuardError::Budget(_))));

    service
        .suspend(&episode.id, Some(json!({"step": 2})))
        .await
        .unwrap();
    assert_eq!(
        service.checkpoint(&episode.id).await.unwrap(),
        Some(json!({"step": 2}))
    );
    service.resume(&episode.id).await.unwrap();
    let done = service
        .complete(&episode.id, json!({"answer": 42}))
        .await
        .unwrap();

    assert_eq!(done.status, EpisodeStatus::Completed);
    assert_eq!(done.budget_state.tokens_used, 100);
    assert_eq!(done.budget_state.tool_calls_used, 2);
    assert!(done.finished_at.is_some());
    assert_eq!(
        audit.kinds(),
        vec![
            AuditKind::EpisodeCreated,
            AuditKind::EpisodeStarted,
            AuditKind::EpisodeSuspended,
            AuditKind::EpisodeResumed,
            AuditKind::EpisodeCompleted,
        ]
    );
}

#[tokio::test]
async fn subcall_budget_is_carved_from_parent() {
    let (service, _audit) = service();
    let parent = service
        .create_episode(
            NewEpisode::new("agent", "plan", "tenant").with_budget(
                BudgetConfig::unbounded()
                    .with_max_tokens(1000)
                    .with_max_subcalls(1),
            ),
        )
        .await
        .unwrap();
    service.start(&parent.id).await.unwrap();
    service
        .apply_usage(
            &parent.id,
            BudgetState {
                tokens_used: 200,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let child = service
        .spawn_subcall(&parent.id, SubcallRequest::new("summarize", json!({})))
        .await
        .unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(child.budget.max_tokens, Some(400));
    assert_eq!(child.agent_id, "agent");

    let second = service
        .spawn_subcall(&parent.id, SubcallRequest::new("again", json!({})))
        .await;
    assert!(matches!(second, Err(StintError::BudgetExceeded(_))));

    let parent = service.get_episode(&parent.id).await.unwrap();
    assert_eq!(parent.child_ids, vec![child.id.clone()]);
}

#[tokio::test]
async fn retries_stop_at_the_ceiling() {
    let (service, _audit) = service();
    let first = service
        .create_episode(
            NewEpisode::new("agent", "flaky", "tenant")
                .with_budget(BudgetConfig::unbounded().with_max_retries(1)),
        )
        .await
        .unwrap();
    service.start(&first.id).await.unwrap();
    service.fail(&first.id, "timeout").await.unwrap();

    let second = service.retry(&first.id).await.unwrap();
    assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.budget_state.retries_used, 1);

    service.start(&second.id).await.unwrap();
    service.fail(&second.id, "timeout again").await.unwrap();
    assert!(matches!(
        service.retry(&second.id).await,
        Err(StintError::RetriesExhausted { used: 1, max: 1, .. })
    ));
}
