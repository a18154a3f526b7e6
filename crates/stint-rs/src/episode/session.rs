//! Sessions bridge a running episode and its live budget tracker.
//!
//! A session exists only while its episode is running. Suspending or
//! finishing closes it, handing the final counters back for persistence;
//! resuming restores a fresh tracker from those counters with the clock
//! restarted at the resume instant.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::Episode;
use crate::budget::{
    BudgetGuard, BudgetObserver, BudgetRequest, BudgetState, BudgetTracker, Clock, SharedTracker,
    SystemClock, DEFAULT_WARNING_THRESHOLD,
};
use crate::error::{Result, StintError};
use crate::tokens::TokenEstimator;

/// Boxed future returned by [`SessionManager`] methods.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Handle to an open session. Clones share the tracker.
#[derive(Debug, Clone)]
pub struct Session {
    pub episode_id: String,
    tracker: SharedTracker,
    estimator: TokenEstimator,
}

impl Session {
    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    /// A guard over this session's tracker.
    pub fn guard(&self) -> BudgetGuard {
        BudgetGuard::new(self.tracker.clone()).with_estimator(self.estimator.clone())
    }

    pub fn snapshot(&self) -> BudgetState {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }
}

pub trait SessionManager: Send + Sync {
    /// Open a session for an episode that is starting. Fails if one is open.
    fn create(&self, episode: &Episode) -> SessionFuture<'_, Session>;
    fn get(&self, episode_id: &str) -> SessionFuture<'_, Option<Session>>;
    /// Reopen a session from the episode's persisted budget state.
    fn restore(&self, episode: &Episode) -> SessionFuture<'_, Session>;
    /// Close and return the final counters. `None` if no session was open.
    fn close(&self, episode_id: &str) -> SessionFuture<'_, Option<BudgetState>>;
    /// Add `delta` to the session's counters and return the new snapshot.
    fn apply_update(&self, episode_id: &str, delta: BudgetState) -> SessionFuture<'_, BudgetState>;
}

/// Sessions held in process memory.
pub struct InMemorySessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
    warning_threshold: f64,
    estimator: TokenEstimator,
    observers: Vec<Arc<dyn BudgetObserver>>,
}

impl Default for InMemorySessionManager {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock::default()),
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            estimator: TokenEstimator::default(),
            observers: Vec::new(),
        }
    }
}

impl InMemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Subscribe an observer to every tracker this manager opens.
    pub fn with_observer(mut self, observer: Arc<dyn BudgetObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn open_count(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, episode: &Episode) -> Result<Session> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&episode.id) {
            return Err(StintError::Store(format!(
                "session for episode {} is already open",
                episode.id
            )));
        }

        let mut tracker = BudgetTracker::new(&episode.id, episode.budget.clone())
            .with_initial_state(episode.budget_state)
            .with_clock(self.clock.clone())
            .with_warning_threshold(self.warning_threshold);
        for observer in &self.observers {
            tracker.subscribe(observer.clone());
        }
        tracker.start();

        let session = Session {
            episode_id: episode.id.clone(),
            tracker: tracker.into_shared(),
            estimator: self.estimator.clone(),
        };
        sessions.insert(episode.id.clone(), session.clone());
        debug!("opened session for episode {}", episode.id);
        Ok(session)
    }
}

impl SessionManager for InMemorySessionManager {
    fn create(&self, episode: &Episode) -> SessionFuture<'_, Session> {
        let result = self.open(episode);
        Box::pin(async move { result })
    }

    fn get(&self, episode_id: &str) -> SessionFuture<'_, Option<Session>> {
        let found = self.sessions().get(episode_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn restore(&self, episode: &Episode) -> SessionFuture<'_, Session> {
        let result = self.open(episode);
        Box::pin(async move { result })
    }

    fn close(&self, episode_id: &str) -> SessionFuture<'_, Option<BudgetState>> {
        let closed = self.sessions().remove(episode_id).map(|session| {
            let mut tracker = session.tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.stop();
            tracker.snapshot()
        });
        if closed.is_some() {
            debug!("closed session for episode {episode_id}");
        }
        Box::pin(async move { Ok(closed) })
    }

    fn apply_update(&self, episode_id: &str, delta: BudgetState) -> SessionFuture<'_, BudgetState> {
        let result = match self.sessions().get(episode_id) {
            Some(session) => {
                let mut tracker = session.tracker.lock().unwrap_or_else(|e| e.into_inner());
                tracker.record_usage(&BudgetRequest::from(delta));
                Ok(tracker.snapshot())
            }
            None => Err(StintError::not_found("session", episode_id)),
        };
        Box::pin(async move { result })
    }
}
