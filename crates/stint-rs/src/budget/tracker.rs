//! Live per-episode budget counters.
//!
//! A [`BudgetTracker`] belongs to exactly one episode session. Subcalls get
//! their own tracker seeded from a derived budget; parent and child never
//! share counters.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, trace};

use super::checker::{BudgetCheck, check_all};
use super::events::{BudgetEvent, BudgetObserver, ThresholdLevel};
use super::{BudgetConfig, BudgetDimension, BudgetRequest, BudgetState, DEFAULT_WARNING_THRESHOLD};

/// A tracker shared between a session and the guards handed to runners.
///
/// Locks are held only for the duration of a check or a record, never
/// across an `.await`.
pub type SharedTracker = Arc<Mutex<BudgetTracker>>;

// ── Clocks ─────────────────────────────────────────────────────────

/// Monotonic millisecond source for the time dimension.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Tracker ────────────────────────────────────────────────────────

/// Mutable counters for one episode.
///
/// Time is measured with explicit [`start`](Self::start) /
/// [`pause`](Self::pause) / [`resume`](Self::resume) / [`stop`](Self::stop)
/// calls: closed intervals are banked into `time_ms_used`, and the open
/// interval (if any) is added on read. While paused the elapsed time is
/// frozen.
///
/// Every record re-evaluates thresholds and notifies observers of newly
/// crossed levels. Observers run while the tracker is borrowed mutably, so
/// they must not call back into the same tracker.
pub struct BudgetTracker {
    episode_id: String,
    config: BudgetConfig,
    /// Counters; `time_ms_used` holds banked (closed-interval) time only.
    state: BudgetState,
    clock: Arc<dyn Clock>,
    /// Clock reading when the current open interval started.
    running_since: Option<u64>,
    started: bool,
    paused: bool,
    stopped: bool,
    warning_threshold: f64,
    tool_calls_by_name: BTreeMap<String, u64>,
    subcall_children: Vec<String>,
    tokens_by_model: BTreeMap<String, u64>,
    crossed: HashMap<BudgetDimension, ThresholdLevel>,
    observers: Vec<Arc<dyn BudgetObserver>>,
}

impl BudgetTracker {
    /// Create a tracker with fresh counters and the system clock.
    pub fn new(episode_id: impl Into<String>, config: BudgetConfig) -> Self {
        Self {
            episode_id: episode_id.into(),
            config,
            state: BudgetState::default(),
            clock: Arc::new(SystemClock::default()),
            running_since: None,
            started: false,
            paused: false,
            stopped: false,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            tool_calls_by_name: BTreeMap::new(),
            subcall_children: Vec::new(),
            tokens_by_model: BTreeMap::new(),
            crossed: HashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Seed counters from persisted state (resume, retry lineage).
    ///
    /// Dimensions already past a threshold are marked as crossed without
    /// notifying, so a restored session does not repeat old warnings.
    pub fn with_initial_state(mut self, state: BudgetState) -> Self {
        self.state = state;
        for dim in BudgetDimension::ALL {
            if let Some(level) = self.level_for(dim, state.used(dim)) {
                self.crossed.insert(dim, level);
            }
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fraction of a ceiling (0.0–1.0) at which the warning fires.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BudgetObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Register an observer on a live tracker.
    pub fn subscribe(&mut self, observer: Arc<dyn BudgetObserver>) {
        self.observers.push(observer);
    }

    /// Wrap into the shared handle used by sessions and guards.
    pub fn into_shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    // ── Time ───────────────────────────────────────────────────────

    /// Start the clock. No-op if already started.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.stopped = false;
        self.running_since = Some(self.clock.now_ms());
        trace!("[{}] budget clock started", self.episode_id);
    }

    /// Freeze elapsed time. No-op unless the clock is running.
    pub fn pause(&mut self) {
        if self.running_since.is_none() {
            return;
        }
        self.bank_open_interval();
        self.paused = true;
        trace!(
            "[{}] budget clock paused at {}ms",
            self.episode_id, self.state.time_ms_used
        );
        self.evaluate_thresholds();
    }

    /// Resume after [`pause`](Self::pause). The paused span is never counted.
    pub fn resume(&mut self) {
        if !self.paused || self.stopped {
            return;
        }
        self.paused = false;
        self.running_since = Some(self.clock.now_ms());
        trace!("[{}] budget clock resumed", self.episode_id);
    }

    /// Stop the clock for good.
    pub fn stop(&mut self) {
        self.bank_open_interval();
        self.paused = false;
        self.stopped = true;
        self.evaluate_thresholds();
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Elapsed metered time including the open interval.
    pub fn elapsed_ms(&self) -> u64 {
        let open = self
            .running_since
            .map_or(0, |since| self.clock.now_ms().saturating_sub(since));
        self.state.time_ms_used.saturating_add(open)
    }

    /// Re-evaluate thresholds against the live clock.
    pub fn tick(&mut self) {
        self.evaluate_thresholds();
    }

    fn bank_open_interval(&mut self) {
        if let Some(since) = self.running_since.take() {
            let span = self.clock.now_ms().saturating_sub(since);
            self.state.add(BudgetDimension::TimeMs, span);
        }
    }

    // ── Recording ──────────────────────────────────────────────────

    pub fn record_tokens(&mut self, tokens: u64) {
        self.state.add(BudgetDimension::Tokens, tokens);
        debug!(
            "[{}] +{tokens} tokens (total {})",
            self.episode_id, self.state.tokens_used
        );
        self.evaluate_thresholds();
    }

    /// Record tokens attributed to a model.
    pub fn record_model_tokens(&mut self, model: &str, tokens: u64) {
        *self.tokens_by_model.entry(model.to_string()).or_insert(0) += tokens;
        self.record_tokens(tokens);
    }

    pub fn record_tool_call(&mut self, name: &str) {
        self.state.add(BudgetDimension::ToolCalls, 1);
        *self.tool_calls_by_name.entry(name.to_string()).or_insert(0) += 1;
        debug!(
            "[{}] tool call {name} ({} total)",
            self.episode_id, self.state.tool_calls_used
        );
        self.evaluate_thresholds();
    }

    pub fn record_subcall(&mut self, child_id: &str) {
        self.state.add(BudgetDimension::Subcalls, 1);
        self.subcall_children.push(child_id.to_string());
        debug!(
            "[{}] subcall {child_id} ({} total)",
            self.episode_id, self.state.subcalls_used
        );
        self.evaluate_thresholds();
    }

    /// Give back the slot taken by [`record_subcall`](Self::record_subcall)
    /// when the child never came into existence. Unknown ids are ignored.
    pub fn release_subcall(&mut self, child_id: &str) {
        let Some(pos) = self.subcall_children.iter().position(|c| c == child_id) else {
            return;
        };
        self.subcall_children.remove(pos);
        self.state.subcalls_used = self.state.subcalls_used.saturating_sub(1);
        debug!(
            "[{}] released subcall {child_id} ({} total)",
            self.episode_id, self.state.subcalls_used
        );
    }

    /// Record every dimension of `usage` at once.
    pub fn record_usage(&mut self, usage: &BudgetRequest) {
        for dim in BudgetDimension::ALL {
            self.state.add(dim, usage.amount(dim));
        }
        debug!("[{}] recorded usage {usage:?}", self.episode_id);
        self.evaluate_thresholds();
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read-only check of `request` against current usage.
    pub fn check_before(&self, request: &BudgetRequest) -> BudgetCheck {
        check_all(&self.config, &self.snapshot(), request)
    }

    /// Copy of the current counters, with live elapsed time.
    pub fn snapshot(&self) -> BudgetState {
        BudgetState {
            time_ms_used: self.elapsed_ms(),
            ..self.state
        }
    }

    /// Capacity left on one dimension. `None` when unbounded.
    pub fn remaining(&self, dimension: BudgetDimension) -> Option<u64> {
        let used = self.snapshot().used(dimension);
        self.config
            .max(dimension)
            .map(|max| max.saturating_sub(used))
    }

    pub fn tool_calls_by_name(&self) -> &BTreeMap<String, u64> {
        &self.tool_calls_by_name
    }

    pub fn subcall_children(&self) -> &[String] {
        &self.subcall_children
    }

    pub fn tokens_by_model(&self) -> &BTreeMap<String, u64> {
        &self.tokens_by_model
    }

    /// Last level notified for a dimension.
    pub fn crossed_level(&self, dimension: BudgetDimension) -> Option<ThresholdLevel> {
        self.crossed.get(&dimension).copied()
    }

    /// Forget the last crossed level so the dimension can notify again.
    pub fn reset_notifications(&mut self, dimension: BudgetDimension) {
        self.crossed.remove(&dimension);
    }

    // ── Thresholds ─────────────────────────────────────────────────

    /// A dimension is exceeded once usage reaches its ceiling, since the
    /// next unit of work would be refused.
    fn level_for(&self, dimension: BudgetDimension, used: u64) -> Option<ThresholdLevel> {
        let max = self.config.max(dimension)?;
        if used == 0 {
            return None;
        }
        if used >= max {
            Some(ThresholdLevel::Exceeded)
        } else if used as f64 >= self.warning_threshold * max as f64 {
            Some(ThresholdLevel::Warning)
        } else {
            None
        }
    }

    fn evaluate_thresholds(&mut self) {
        let snapshot = self.snapshot();
        let mut events = Vec::new();

        for dim in BudgetDimension::ALL {
            let (Some(max), used) = (self.config.max(dim), snapshot.used(dim)) else {
                continue;
            };
            let Some(level) = self.level_for(dim, used) else {
                continue;
            };
            let last = self.crossed.get(&dim).copied();
            if last.is_some_and(|l| l >= level) {
                continue;
            }

            if last.is_none() {
                events.push(BudgetEvent::Warning {
                    episode_id: self.episode_id.clone(),
                    dimension: dim,
                    used,
                    max,
                    fraction: if max == 0 { 1.0 } else { used as f64 / max as f64 },
                });
            }
            if level == ThresholdLevel::Exceeded {
                events.push(BudgetEvent::Exceeded {
                    episode_id: self.episode_id.clone(),
                    dimension: dim,
                    used,
                    max,
                });
            }
            self.crossed.insert(dim, level);
        }

        for event in &events {
            for observer in &self.observers {
                observer.on_budget_event(event);
            }
        }
    }
}

impl fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("episode_id", &self.episode_id)
            .field("config", &self.config)
            .field("state", &self.snapshot())
            .field("running", &self.is_running())
            .field("paused", &self.paused)
            .field("observers", &self.observers.len())
            .finish()
    }
}
