//! Episode lifecycle orchestration.
//!
//! Every operation loads the episode, validates the requested transition
//! against the lifecycle graph *before* touching anything, performs the
//! session side effects, persists, and audits. A rejected transition leaves
//! storage untouched.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use super::session::{Session, SessionManager};
use super::store::EpisodeStore;
use super::{
    Episode, EpisodeFilter, EpisodeStatus, EpisodeTransition, Metadata, NewEpisode,
    SubcallRequest,
};
use crate::audit::{AuditEmitter, AuditEvent, AuditKind};
use crate::budget::{BudgetConfig, BudgetGuard, BudgetState, SubBudgetOptions, SubcallAllocation};
use crate::error::{Result, StintError};
use crate::ids::generate_id;

pub struct EpisodeService {
    store: Arc<dyn EpisodeStore>,
    sessions: Arc<dyn SessionManager>,
    audit: Arc<dyn AuditEmitter>,
    default_budget: BudgetConfig,
    subcall_defaults: SubBudgetOptions,
    metadata_schema: Option<Value>,
}

impl EpisodeService {
    pub fn new(
        store: Arc<dyn EpisodeStore>,
        sessions: Arc<dyn SessionManager>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            store,
            sessions,
            audit,
            default_budget: BudgetConfig::unbounded(),
            subcall_defaults: SubBudgetOptions::default(),
            metadata_schema: None,
        }
    }

    /// Budget applied when a new episode does not specify one.
    pub fn with_default_budget(mut self, budget: BudgetConfig) -> Self {
        self.default_budget = budget;
        self
    }

    /// Child budget derivation used when a subcall request sets none.
    pub fn with_subcall_defaults(mut self, options: SubBudgetOptions) -> Self {
        self.subcall_defaults = options;
        self
    }

    /// JSON schema every new episode's metadata must satisfy.
    pub fn with_metadata_schema(mut self, schema: Value) -> Self {
        self.metadata_schema = Some(schema);
        self
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn get_episode(&self, id: &str) -> Result<Episode> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| StintError::not_found("episode", id))
    }

    pub async fn list_episodes(&self, tenant_id: &str, filter: &EpisodeFilter) -> Result<Vec<Episode>> {
        self.store.list(tenant_id, filter).await
    }

    /// Checkpoint saved by the last suspend, if any.
    pub async fn checkpoint(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.get_episode(id).await?.checkpoint)
    }

    /// Budget guard for a running episode's session.
    pub async fn guard(&self, id: &str) -> Result<BudgetGuard> {
        let session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| StintError::not_found("session", id))?;
        Ok(session.guard())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub async fn create_episode(&self, new: NewEpisode) -> Result<Episode> {
        if new.agent_id.trim().is_empty() {
            return Err(StintError::InvalidInput("agent_id must not be empty".into()));
        }
        if new.tenant_id.trim().is_empty() {
            return Err(StintError::InvalidInput("tenant_id must not be empty".into()));
        }
        self.validate_metadata(&new.metadata)?;

        let now = Utc::now();
        let episode = Episode {
            id: generate_id("ep"),
            agent_id: new.agent_id,
            task_type: new.task_type,
            tenant_id: new.tenant_id,
            parent_id: None,
            child_ids: Vec::new(),
            status: EpisodeStatus::Created,
            budget: new.budget.unwrap_or_else(|| self.default_budget.clone()),
            budget_state: BudgetState::default(),
            input: new.input,
            output: None,
            checkpoint: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            metadata: new.metadata,
        };
        self.store.insert(episode.clone()).await?;
        info!(
            "created episode {} ({} / {})",
            episode.id, episode.agent_id, episode.task_type
        );
        self.emit(AuditKind::EpisodeCreated, &episode).await;
        Ok(episode)
    }

    /// `created → running`: open a session and start the budget clock.
    pub async fn start(&self, id: &str) -> Result<Episode> {
        let mut episode = self.get_episode(id).await?;
        let next = episode.status.apply(EpisodeTransition::Start)?;

        self.sessions.create(&episode).await?;
        let now = Utc::now();
        episode.status = next;
        episode.started_at = Some(now);
        episode.updated_at = now;
        if let Err(e) = self.store.update(episode.clone()).await {
            self.close_best_effort(id).await;
            return Err(e);
        }

        info!("started episode {id}");
        self.emit(AuditKind::EpisodeStarted, &episode).await;
        Ok(episode)
    }

    /// `running → suspended`: persist the session's counters and an optional
    /// checkpoint, then close the session.
    pub async fn suspend(&self, id: &str, checkpoint: Option<Value>) -> Result<Episode> {
        let mut episode = self.get_episode(id).await?;
        let next = episode.status.apply(EpisodeTransition::Suspend)?;

        let session = self.freeze_session(&mut episode).await?;
        episode.status = next;
        if checkpoint.is_some() {
            episode.checkpoint = checkpoint;
        }
        episode.updated_at = Utc::now();
        self.persist_and_close(&mut episode, session).await?;

        info!(
            "suspended episode {id} at {}ms",
            episode.budget_state.time_ms_used
        );
        self.emit(AuditKind::EpisodeSuspended, &episode).await;
        Ok(episode)
    }

    /// `suspended → running`: restore the session from persisted counters.
    pub async fn resume(&self, id: &str) -> Result<Episode> {
        let mut episode = self.get_episode(id).await?;
        let next = episode.status.apply(EpisodeTransition::Resume)?;

        self.sessions.restore(&episode).await?;
        episode.status = next;
        episode.updated_at = Utc::now();
        if let Err(e) = self.store.update(episode.clone()).await {
            self.close_best_effort(id).await;
            return Err(e);
        }

        info!("resumed episode {id}");
        self.emit(AuditKind::EpisodeResumed, &episode).await;
        Ok(episode)
    }

    /// `running → completed`. `output` must not be null.
    pub async fn complete(&self, id: &str, output: Value) -> Result<Episode> {
        let mut episode = self.get_episode(id).await?;
        let next = episode.status.apply(EpisodeTransition::Complete)?;
        if output.is_null() {
            return Err(StintError::InvalidInput(format!(
                "episode {id} cannot complete without outputs"
            )));
        }

        let session = self.freeze_session(&mut episode).await?;
        let now = Utc::now();
        episode.status = next;
        episode.output = Some(output);
        episode.finished_at = Some(now);
        episode.updated_at = now;
        self.persist_and_close(&mut episode, session).await?;

        info!(
            "completed episode {id}: {} tokens, {} tool calls, {}ms",
            episode.budget_state.tokens_used,
            episode.budget_state.tool_calls_used,
            episode.budget_state.time_ms_used
        );
        self.emit(AuditKind::EpisodeCompleted, &episode).await;
        Ok(episode)
    }

    /// `running | suspended → failed`. The session is closed best-effort
    /// once the failure is persisted.
    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Result<Episode> {
        let mut episode = self.get_episode(id).await?;
        let next = episode.status.apply(EpisodeTransition::Fail)?;

        let session = match self.freeze_session(&mut episode).await {
            Ok(session) => session,
            Err(e) => {
                warn!("failed to read session for episode {id}: {e}");
                None
            }
        };
        let now = Utc::now();
        episode.status = next;
        episode.error = Some(error.into());
        episode.finished_at = Some(now);
        episode.updated_at = now;
        self.persist_and_close(&mut episode, session).await?;

        warn!(
            "episode {id} failed: {}",
            episode.error.as_deref().unwrap_or_default()
        );
        self.emit(AuditKind::EpisodeFailed, &episode).await;
        Ok(episode)
    }

    /// Retry a failed episode as a new `created` episode.
    ///
    /// The new episode's parent is the failed one and its retry counter is
    /// the failed one's plus one. The failed episode's own counters are left
    /// alone; it only gains the new child id.
    pub async fn retry(&self, id: &str) -> Result<Episode> {
        let mut failed = self.get_episode(id).await?;
        let status = failed.status.apply(EpisodeTransition::Retry)?;

        let used = failed.budget_state.retries_used;
        if let Some(max) = failed.budget.max_retries
            && used >= max
        {
            return Err(StintError::RetriesExhausted {
                episode_id: id.to_string(),
                used,
                max,
            });
        }

        let now = Utc::now();
        let retry = Episode {
            id: generate_id("ep"),
            agent_id: failed.agent_id.clone(),
            task_type: failed.task_type.clone(),
            tenant_id: failed.tenant_id.clone(),
            parent_id: Some(failed.id.clone()),
            child_ids: Vec::new(),
            status,
            budget: failed.budget.clone(),
            budget_state: BudgetState {
                retries_used: used + 1,
                ..BudgetState::default()
            },
            input: failed.input.clone(),
            output: None,
            checkpoint: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            metadata: failed.metadata.clone(),
        };
        self.store.insert(retry.clone()).await?;
        failed.child_ids.push(retry.id.clone());
        failed.updated_at = now;
        self.store.update(failed).await?;

        info!(
            "retrying episode {id} as {} (retry {})",
            retry.id,
            used + 1
        );
        self.emit(AuditKind::EpisodeRetried, &retry).await;
        Ok(retry)
    }

    /// Fork a subcall episode from a running parent.
    ///
    /// The child budget is carved from the parent's remaining capacity at
    /// this instant and is not linked to the parent afterwards.
    pub async fn spawn_subcall(&self, parent_id: &str, request: SubcallRequest) -> Result<Episode> {
        let mut parent = self.get_episode(parent_id).await?;
        if parent.status != EpisodeStatus::Running {
            return Err(StintError::InvalidInput(format!(
                "subcalls can only be spawned from a running episode ({parent_id} is {})",
                parent.status
            )));
        }
        self.validate_metadata(&request.metadata)?;
        let session = self
            .sessions
            .get(parent_id)
            .await?
            .ok_or_else(|| StintError::not_found("session", parent_id))?;

        let child_id = generate_id("ep");
        let options = request
            .options
            .unwrap_or_else(|| self.subcall_defaults.clone());
        let allocation = SubcallAllocation::new(&child_id).with_options(options);
        let guard = session.guard();
        let budget = guard.allocate_subcall_budget(&allocation)?;

        let now = Utc::now();
        let child = Episode {
            id: child_id,
            agent_id: request.agent_id.unwrap_or_else(|| parent.agent_id.clone()),
            task_type: request.task_type,
            tenant_id: parent.tenant_id.clone(),
            parent_id: Some(parent.id.clone()),
            child_ids: Vec::new(),
            status: EpisodeStatus::Created,
            budget,
            budget_state: BudgetState::default(),
            input: request.input,
            output: None,
            checkpoint: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            metadata: request.metadata,
        };
        if let Err(e) = self.store.insert(child.clone()).await {
            guard.release_subcall_budget(&allocation);
            return Err(e);
        }
        parent.child_ids.push(child.id.clone());
        parent.budget_state = parent.budget_state.merge_max(&session.snapshot());
        parent.updated_at = now;
        self.store.update(parent).await?;

        info!("spawned subcall {} from {parent_id}", child.id);
        self.emit(AuditKind::SubcallSpawned, &child).await;
        Ok(child)
    }

    /// Apply an externally metered usage delta to a running episode's session
    /// and persist the resulting counters.
    pub async fn apply_usage(&self, id: &str, delta: BudgetState) -> Result<BudgetState> {
        let mut episode = self.get_episode(id).await?;
        if episode.status.is_terminal() {
            return Err(StintError::InvalidInput(format!(
                "episode {id} is {}; usage can no longer be applied",
                episode.status
            )));
        }
        let state = self.sessions.apply_update(id, delta).await?;
        episode.budget_state = episode.budget_state.merge_max(&state);
        episode.updated_at = Utc::now();
        self.store.update(episode).await?;
        Ok(state)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn validate_metadata(&self, metadata: &Metadata) -> Result<()> {
        let Some(schema) = &self.metadata_schema else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| StintError::Config(format!("invalid metadata schema: {e}")))?;
        let instance = Value::Object(metadata.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StintError::InvalidInput(format!(
                "metadata does not match schema: {}",
                errors.join("; ")
            )))
        }
    }

    /// Freeze the open session's clock and fold its counters into `episode`.
    /// The session stays open until the episode is persisted.
    async fn freeze_session(&self, episode: &mut Episode) -> Result<Option<Session>> {
        let session = self.sessions.get(&episode.id).await?;
        if let Some(session) = &session {
            let mut tracker = session.tracker().lock().unwrap_or_else(|e| e.into_inner());
            tracker.pause();
            episode.budget_state = episode.budget_state.merge_max(&tracker.snapshot());
        }
        Ok(session)
    }

    /// Persist `episode`, then close the session frozen by
    /// [`freeze_session`](Self::freeze_session). A failed write resumes the
    /// session with every counter intact.
    async fn persist_and_close(&self, episode: &mut Episode, session: Option<Session>) -> Result<()> {
        if let Err(e) = self.store.update(episode.clone()).await {
            if let Some(session) = &session {
                session
                    .tracker()
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .resume();
            }
            warn!("failed to persist episode {}, session kept open: {e}", episode.id);
            return Err(e);
        }
        if session.is_none() {
            return Ok(());
        }

        match self.sessions.close(&episode.id).await {
            Ok(Some(state)) => {
                // Usage recorded between the freeze and the close.
                let merged = episode.budget_state.merge_max(&state);
                if merged != episode.budget_state {
                    episode.budget_state = merged;
                    self.store.update(episode.clone()).await?;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("failed to close session for episode {}: {e}", episode.id),
        }
        Ok(())
    }

    async fn close_best_effort(&self, id: &str) {
        if let Err(e) = self.sessions.close(id).await {
            warn!("failed to close session for episode {id}: {e}");
        }
    }

    async fn emit(&self, kind: AuditKind, episode: &Episode) {
        let mut event = AuditEvent::new(kind, &episode.agent_id, &episode.id)
            .with_field("tenant_id", episode.tenant_id.clone())
            .with_field("task_type", episode.task_type.clone())
            .with_field("status", episode.status.as_str());
        if let Some(parent) = &episode.parent_id {
            event = event.with_field("parent_id", parent.clone());
        }
        if let Some(error) = &episode.error {
            event = event.with_field("error", error.clone());
        }
        if let Ok(state) = serde_json::to_value(episode.budget_state) {
            event = event.with_field("budget_state", state);
        }
        self.audit.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditEmitter;
    use crate::budget::{BudgetDimension, ManualClock};
    use crate::episode::{InMemoryEpisodeStore, InMemorySessionManager};
    use crate::budget::BudgetRequest;
    use crate::episode::store::EpisodeFuture;
    use crate::error::GuardError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store that can be told to refuse its next write.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryEpisodeStore,
        fail_update: AtomicBool,
        fail_insert: AtomicBool,
    }

    impl EpisodeStore for FlakyStore {
        fn insert(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
            if self.fail_insert.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Err(StintError::Store("disk full".into())) });
            }
            self.inner.insert(episode)
        }

        fn update(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
            if self.fail_update.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Err(StintError::Store("disk full".into())) });
            }
            self.inner.update(episode)
        }

        fn get(&self, id: &str) -> EpisodeFuture<'_, Option<Episode>> {
            self.inner.get(id)
        }

        fn list(&self, tenant_id: &str, filter: &EpisodeFilter) -> EpisodeFuture<'_, Vec<Episode>> {
            self.inner.list(tenant_id, filter)
        }
    }

    fn flaky_fixture() -> (EpisodeService, Arc<FlakyStore>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(FlakyStore::default());
        let sessions =
            Arc::new(InMemorySessionManager::new().with_clock(Arc::new(clock.clone())));
        let service = EpisodeService::new(
            store.clone(),
            sessions,
            Arc::new(RecordingAuditEmitter::new()),
        )
        .with_default_budget(BudgetConfig::unbounded().with_max_tokens(1_000));
        (service, store, clock)
    }

    fn tokens(n: u64) -> BudgetState {
        BudgetState {
            tokens_used: n,
            ..Default::default()
        }
    }

    struct Fixture {
        service: EpisodeService,
        audit: Arc<RecordingAuditEmitter>,
        store: Arc<InMemoryEpisodeStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryEpisodeStore::new());
        let audit = Arc::new(RecordingAuditEmitter::new());
        let sessions =
            Arc::new(InMemorySessionManager::new().with_clock(Arc::new(clock.clone())));
        let service = EpisodeService::new(store.clone(), sessions, audit.clone())
            .with_default_budget(BudgetConfig::unbounded().with_max_tokens(1_000).with_max_retries(2));
        Fixture {
            service,
            audit,
            store,
            clock,
        }
    }

    fn new_episode() -> NewEpisode {
        NewEpisode::new("agent-1", "draft_post", "tenant-1").with_input(json!({"topic": "launch"}))
    }

    #[tokio::test]
    async fn suspend_freezes_time_and_keeps_checkpoint() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&ep.id).await.unwrap();
        f.clock.advance(100);

        let suspended = f
            .service
            .suspend(&ep.id, Some(json!({"step": 3})))
            .await
            .unwrap();
        assert_eq!(suspended.budget_state.time_ms_used, 100);
        f.clock.advance(10_000);
        assert_eq!(f.service.checkpoint(&ep.id).await.unwrap(), Some(json!({"step": 3})));
        assert!(f.service.guard(&ep.id).await.is_err());

        f.service.resume(&ep.id).await.unwrap();
        f.clock.advance(50);
        let done = f.service.complete(&ep.id, json!("ok")).await.unwrap();
        assert_eq!(done.budget_state.time_ms_used, 150);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_storage_untouched() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        let before = f.store.get(&ep.id).await.unwrap();

        for result in [
            f.service.resume(&ep.id).await,
            f.service.suspend(&ep.id, None).await,
            f.service.complete(&ep.id, json!(1)).await,
            f.service.retry(&ep.id).await,
        ] {
            assert!(matches!(result, Err(StintError::InvalidTransition { .. })));
        }
        assert_eq!(f.store.get(&ep.id).await.unwrap(), before);
        assert_eq!(f.audit.kinds(), vec![AuditKind::EpisodeCreated]);
    }

    #[tokio::test]
    async fn complete_requires_output() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&ep.id).await.unwrap();
        let err = f.service.complete(&ep.id, Value::Null).await.unwrap_err();
        assert!(matches!(err, StintError::InvalidInput(_)));
        assert_eq!(
            f.service.get_episode(&ep.id).await.unwrap().status,
            EpisodeStatus::Running
        );
    }

    #[tokio::test]
    async fn fail_from_suspended() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&ep.id).await.unwrap();
        f.service.suspend(&ep.id, None).await.unwrap();
        let failed = f.service.fail(&ep.id, "operator cancelled").await.unwrap();
        assert_eq!(failed.status, EpisodeStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("operator cancelled"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn retry_chains_lineage_until_exhausted() {
        let f = fixture();
        let first = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&first.id).await.unwrap();
        f.service.fail(&first.id, "boom").await.unwrap();

        let second = f.service.retry(&first.id).await.unwrap();
        assert_eq!(second.status, EpisodeStatus::Created);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.budget_state.retries_used, 1);
        assert_eq!(second.input, first.input);
        let first_after = f.service.get_episode(&first.id).await.unwrap();
        assert_eq!(first_after.budget_state.retries_used, 0);
        assert_eq!(first_after.child_ids, vec![second.id.clone()]);

        f.service.start(&second.id).await.unwrap();
        f.service.fail(&second.id, "boom").await.unwrap();
        let third = f.service.retry(&second.id).await.unwrap();
        assert_eq!(third.budget_state.retries_used, 2);

        f.service.start(&third.id).await.unwrap();
        f.service.fail(&third.id, "boom").await.unwrap();
        let err = f.service.retry(&third.id).await.unwrap_err();
        assert!(matches!(
            err,
            StintError::RetriesExhausted { used: 2, max: 2, .. }
        ));
    }

    #[tokio::test]
    async fn guard_meters_the_running_session() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&ep.id).await.unwrap();
        let guard = f.service.guard(&ep.id).await.unwrap();

        let denied: std::result::Result<(), GuardError<String>> = guard
            .with_check(crate::budget::BudgetRequest::tokens(5_000), || async {
                Ok(crate::budget::Metered::estimated(()))
            })
            .await;
        assert!(denied.unwrap_err().is_budget());

        let _: std::result::Result<(), GuardError<String>> = guard
            .with_check(crate::budget::BudgetRequest::tokens(400), || async {
                Ok(crate::budget::Metered::estimated(()))
            })
            .await;
        let done = f.service.complete(&ep.id, json!({"post": "hi"})).await.unwrap();
        assert_eq!(done.budget_state.tokens_used, 400);
    }

    #[tokio::test]
    async fn subcall_gets_fraction_of_parent_remaining() {
        let f = fixture();
        let parent = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&parent.id).await.unwrap();
        f.service
            .apply_usage(
                &parent.id,
                BudgetState {
                    tokens_used: 200,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let child = f
            .service
            .spawn_subcall(
                &parent.id,
                SubcallRequest::new("research", json!({}))
                    .with_options(SubBudgetOptions::default().with_fraction(0.25)),
            )
            .await
            .unwrap();
        assert_eq!(child.budget.max_tokens, Some(200));
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.agent_id, "agent-1");

        let parent_after = f.service.get_episode(&parent.id).await.unwrap();
        assert_eq!(parent_after.child_ids, vec![child.id.clone()]);
        assert_eq!(parent_after.budget_state.subcalls_used, 1);

        let children = f
            .service
            .list_episodes("tenant-1", &EpisodeFilter::default().with_parent(&parent.id))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(f.audit.of_kind(AuditKind::SubcallSpawned).len(), 1);
    }

    #[tokio::test]
    async fn subcall_respects_parent_subcall_ceiling() {
        let f = fixture();
        let parent = f
            .service
            .create_episode(new_episode().with_budget(BudgetConfig::unbounded().with_max_subcalls(0)))
            .await
            .unwrap();
        f.service.start(&parent.id).await.unwrap();
        let err = f
            .service
            .spawn_subcall(&parent.id, SubcallRequest::new("x", json!(null)))
            .await
            .unwrap_err();
        match err {
            StintError::BudgetExceeded(e) => assert!(e.violated(BudgetDimension::Subcalls)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn metadata_is_validated_against_schema() {
        let f = fixture();
        let service = f.service.with_metadata_schema(json!({
            "type": "object",
            "properties": {"campaign": {"type": "string"}},
            "required": ["campaign"]
        }));
        let err = service.create_episode(new_episode()).await.unwrap_err();
        assert!(matches!(err, StintError::InvalidInput(_)));
        service
            .create_episode(new_episode().with_metadata("campaign", "spring"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_suspend_write_keeps_session_and_usage() {
        let (service, store, clock) = flaky_fixture();
        let ep = service.create_episode(new_episode()).await.unwrap();
        service.start(&ep.id).await.unwrap();
        service.apply_usage(&ep.id, tokens(900)).await.unwrap();
        clock.advance(40);

        store.fail_update.store(true, Ordering::SeqCst);
        let err = service.suspend(&ep.id, None).await.unwrap_err();
        assert!(matches!(err, StintError::Store(_)));

        // Still running and still metered.
        assert_eq!(
            service.get_episode(&ep.id).await.unwrap().status,
            EpisodeStatus::Running
        );
        let guard = service.guard(&ep.id).await.unwrap();
        assert!(!guard.check(&BudgetRequest::tokens(900)).allowed);

        clock.advance(60);
        let suspended = service.suspend(&ep.id, None).await.unwrap();
        assert_eq!(suspended.budget_state.tokens_used, 900);
        assert_eq!(suspended.budget_state.time_ms_used, 100);
        assert_eq!(
            service.get_episode(&ep.id).await.unwrap().budget_state.tokens_used,
            900
        );

        service.resume(&ep.id).await.unwrap();
        let guard = service.guard(&ep.id).await.unwrap();
        assert!(!guard.check(&BudgetRequest::tokens(900)).allowed);
    }

    #[tokio::test]
    async fn failed_complete_and_fail_writes_can_be_retried() {
        let (service, store, _clock) = flaky_fixture();
        let ep = service.create_episode(new_episode()).await.unwrap();
        service.start(&ep.id).await.unwrap();
        service.apply_usage(&ep.id, tokens(300)).await.unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        assert!(service.complete(&ep.id, json!("ok")).await.is_err());
        store.fail_update.store(true, Ordering::SeqCst);
        assert!(service.fail(&ep.id, "crashed").await.is_err());

        service.apply_usage(&ep.id, tokens(50)).await.unwrap();
        let done = service.complete(&ep.id, json!("ok")).await.unwrap();
        assert_eq!(done.status, EpisodeStatus::Completed);
        assert_eq!(done.budget_state.tokens_used, 350);
    }

    #[tokio::test]
    async fn failed_child_insert_returns_the_subcall_slot() {
        let (service, store, _clock) = flaky_fixture();
        let parent = service
            .create_episode(new_episode().with_budget(
                BudgetConfig::unbounded().with_max_tokens(1_000).with_max_subcalls(1),
            ))
            .await
            .unwrap();
        service.start(&parent.id).await.unwrap();

        store.fail_insert.store(true, Ordering::SeqCst);
        let err = service
            .spawn_subcall(&parent.id, SubcallRequest::new("research", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StintError::Store(_)));
        let guard = service.guard(&parent.id).await.unwrap();
        assert!(guard.check(&BudgetRequest::subcall()).allowed);

        let child = service
            .spawn_subcall(&parent.id, SubcallRequest::new("research", json!({})))
            .await
            .unwrap();
        let parent_after = service.get_episode(&parent.id).await.unwrap();
        assert_eq!(parent_after.child_ids, vec![child.id]);
        assert_eq!(parent_after.budget_state.subcalls_used, 1);
    }

    #[tokio::test]
    async fn usage_is_refused_once_terminal() {
        let f = fixture();
        let ep = f.service.create_episode(new_episode()).await.unwrap();
        f.service.start(&ep.id).await.unwrap();
        f.service.complete(&ep.id, json!("ok")).await.unwrap();

        let err = f.service.apply_usage(&ep.id, tokens(10)).await.unwrap_err();
        assert!(matches!(err, StintError::InvalidInput(_)));
        assert_eq!(
            f.service.get_episode(&ep.id).await.unwrap().budget_state.tokens_used,
            0
        );
    }

    #[tokio::test]
    async fn missing_episode_is_not_found() {
        let f = fixture();
        let err = f.service.start("ep-nope").await.unwrap_err();
        assert!(err.to_string().contains("ep-nope"));
    }
}
