//! Priority-tiered eviction over a [`MemoryStore`].
//!
//! A sweep fetches a snapshot of candidates, drops what may not be evicted
//! (pinned always, session-tier while a session is active), orders each
//! remaining tier by the configured [`EvictionStrategy`], and walks
//! ephemeral → sliding → session until the target is met. Victims are
//! removed in one batch and each one is audited.
//!
//! Sweeps are mutually exclusive per engine. A sweep started while another
//! is running returns an empty result flagged `contended`; callers that need
//! progress retry. Entries inserted after the snapshot are invisible to the
//! running sweep.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::pinned::PinnedConfig;
use super::priority::{MemoryEntry, MemoryPriority};
use super::store::MemoryStore;
use crate::audit::{AuditEmitter, AuditEvent, AuditKind};
use crate::error::{Result, StintError};

/// Default headroom added on top of an overage by [`EvictionEngine::auto_evict`].
pub const DEFAULT_HEADROOM_FRACTION: f64 = 0.10;

/// Victim ordering within a tier.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Oldest access first.
    Lru,
    /// Fewest accesses first.
    Lfu,
    /// Oldest creation first.
    Fifo,
    /// Lowest eviction score first.
    #[default]
    Weighted,
}

/// Memory pressure ceilings and sweep behavior.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    pub strategy: EvictionStrategy,
    /// Ceiling on the number of stored entries.
    pub max_entries: Option<u64>,
    /// Ceiling on the summed entry size, in tokens.
    pub max_total_tokens: Option<u64>,
    /// Fraction of an exceeded ceiling evicted beyond the overage.
    pub headroom_fraction: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            strategy: EvictionStrategy::default(),
            max_entries: None,
            max_total_tokens: None,
            headroom_fraction: DEFAULT_HEADROOM_FRACTION,
        }
    }
}

impl EvictionConfig {
    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_entries(mut self, max: u64) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn with_max_total_tokens(mut self, max: u64) -> Self {
        self.max_total_tokens = Some(max);
        self
    }

    pub fn with_headroom_fraction(mut self, fraction: f64) -> Self {
        self.headroom_fraction = fraction;
        self
    }

    fn headroom(&self, ceiling: u64) -> u64 {
        let fraction = if self.headroom_fraction.is_finite() {
            self.headroom_fraction.max(0.0)
        } else {
            0.0
        };
        (ceiling as f64 * fraction).ceil() as u64
    }
}

/// How much a sweep should free.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionTarget {
    Tokens(u64),
    Count(u64),
}

impl EvictionTarget {
    fn is_met(&self, freed_tokens: u64, evicted: u64) -> bool {
        match *self {
            EvictionTarget::Tokens(target) => freed_tokens >= target,
            EvictionTarget::Count(target) => evicted >= target,
        }
    }
}

/// Parameters for one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionRequest {
    pub target: EvictionTarget,
    /// Restrict the sweep to one tenant. `None` sweeps every tenant.
    pub tenant_id: Option<String>,
    /// Whether a session is active. Defaults to `true`, which protects the
    /// session tier.
    pub session_active: bool,
    pub reason: String,
}

impl EvictionRequest {
    pub fn tokens(target: u64) -> Self {
        Self::new(EvictionTarget::Tokens(target))
    }

    pub fn count(target: u64) -> Self {
        Self::new(EvictionTarget::Count(target))
    }

    fn new(target: EvictionTarget) -> Self {
        Self {
            target,
            tenant_id: None,
            session_active: true,
            reason: "manual".into(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_session_active(mut self, active: bool) -> Self {
        self.session_active = active;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Outcome of a sweep. An unmet target is reported, never raised.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EvictionResult {
    pub evicted_ids: Vec<String>,
    pub freed_tokens: u64,
    pub elapsed_ms: u64,
    pub skipped_pinned: u64,
    pub skipped_session: u64,
    pub insufficient_evictable: bool,
    /// Another sweep held the lock; nothing was examined.
    pub contended: bool,
    pub reason: String,
}

impl EvictionResult {
    pub fn evicted_count(&self) -> usize {
        self.evicted_ids.len()
    }

    fn absorb(&mut self, other: EvictionResult) {
        self.evicted_ids.extend(other.evicted_ids);
        self.freed_tokens += other.freed_tokens;
        self.elapsed_ms += other.elapsed_ms;
        self.skipped_pinned = self.skipped_pinned.max(other.skipped_pinned);
        self.skipped_session = self.skipped_session.max(other.skipped_session);
        self.insufficient_evictable |= other.insufficient_evictable;
        self.contended |= other.contended;
    }
}

/// Result of [`EvictionEngine::needs_eviction`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PressureReport {
    pub needed: bool,
    /// Human-readable description of every exceeded ceiling.
    pub reason: Option<String>,
    pub entry_count: u64,
    pub total_tokens: u64,
    /// Overage plus headroom for the token ceiling, if exceeded.
    pub token_target: Option<u64>,
    /// Overage plus headroom for the entry ceiling, if exceeded.
    pub count_target: Option<u64>,
}

/// Selects and removes memory entries under pressure.
pub struct EvictionEngine {
    store: Arc<dyn MemoryStore>,
    audit: Arc<dyn AuditEmitter>,
    config: EvictionConfig,
    pinned: PinnedConfig,
    sweep: Mutex<()>,
}

impl EvictionEngine {
    pub fn new(store: Arc<dyn MemoryStore>, audit: Arc<dyn AuditEmitter>) -> Self {
        Self {
            store,
            audit,
            config: EvictionConfig::default(),
            pinned: PinnedConfig::default(),
            sweep: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: EvictionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pinned_config(mut self, pinned: PinnedConfig) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Run one sweep.
    pub async fn evict(&self, request: &EvictionRequest) -> Result<EvictionResult> {
        let Ok(_sweep) = self.sweep.try_lock() else {
            debug!("eviction sweep already running, skipping ({})", request.reason);
            return Ok(EvictionResult {
                contended: true,
                reason: request.reason.clone(),
                ..Default::default()
            });
        };

        let started = Instant::now();
        let now = Utc::now();
        let snapshot = self
            .store
            .fetch_evictable(request.tenant_id.as_deref())
            .await?;

        let mut skipped_pinned = 0;
        let mut skipped_session = 0;
        let mut ephemeral = Vec::new();
        let mut sliding = Vec::new();
        let mut session = Vec::new();

        for entry in snapshot {
            if let Some(tenant) = &request.tenant_id
                && &entry.tenant_id != tenant
            {
                continue;
            }
            let candidate = Candidate {
                score: entry.score_at(now),
                entry,
            };
            let priority = candidate.entry.priority;
            if !priority.is_evictable(request.session_active) {
                match priority {
                    MemoryPriority::Pinned => skipped_pinned += 1,
                    _ => skipped_session += 1,
                }
                continue;
            }
            match priority {
                MemoryPriority::Session => session.push(candidate),
                MemoryPriority::Sliding => sliding.push(candidate),
                _ => ephemeral.push(candidate),
            }
        }

        for tier in [&mut ephemeral, &mut sliding, &mut session] {
            tier.sort_by(|a, b| compare(self.config.strategy, a, b));
        }

        let mut victims = Vec::new();
        let mut freed_tokens = 0u64;
        for candidate in ephemeral.into_iter().chain(sliding).chain(session) {
            if request.target.is_met(freed_tokens, victims.len() as u64) {
                break;
            }
            freed_tokens = freed_tokens.saturating_add(candidate.entry.size_tokens);
            victims.push(candidate);
        }
        let insufficient = !request.target.is_met(freed_tokens, victims.len() as u64);

        let ids: Vec<String> = victims.iter().map(|c| c.entry.id.clone()).collect();
        if !ids.is_empty() {
            self.store.delete_batch(&ids).await?;
        }

        let audits = victims.iter().map(|victim| {
            let event = AuditEvent::new(AuditKind::MemoryEvicted, "system", &victim.entry.id)
                .with_field("tenant_id", victim.entry.tenant_id.clone())
                .with_field("tier", victim.entry.priority.as_str())
                .with_field("size_tokens", victim.entry.size_tokens)
                .with_field("eviction_score", victim.score)
                .with_field("reason", request.reason.clone())
                .with_time(now);
            self.audit.emit(event)
        });
        futures::future::join_all(audits).await;

        let result = EvictionResult {
            evicted_ids: ids,
            freed_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
            skipped_pinned,
            skipped_session,
            insufficient_evictable: insufficient,
            contended: false,
            reason: request.reason.clone(),
        };
        info!(
            "evicted {} entries ({} tokens), skipped {} pinned / {} session{}",
            result.evicted_count(),
            result.freed_tokens,
            result.skipped_pinned,
            result.skipped_session,
            if insufficient { ", target not met" } else { "" }
        );
        Ok(result)
    }

    /// Whether `size` more pinned tokens fit in the tenant's pinned budget.
    pub async fn can_pin(&self, tenant_id: &str, size: u64) -> Result<bool> {
        let used = self.store.pinned_size(tenant_id).await?;
        Ok(used.saturating_add(size) <= self.pinned.budget_for(tenant_id))
    }

    /// Compare store totals with the configured ceilings. Reads only.
    pub async fn needs_eviction(&self) -> Result<PressureReport> {
        let entry_count = self.store.count().await?;
        let total_tokens = self.store.total_size().await?;
        let mut reasons = Vec::new();

        let token_target = self
            .config
            .max_total_tokens
            .filter(|max| total_tokens > *max)
            .map(|max| {
                reasons.push(format!("total size {total_tokens} tokens exceeds max {max}"));
                total_tokens - max + self.config.headroom(max)
            });
        let count_target = self
            .config
            .max_entries
            .filter(|max| entry_count > *max)
            .map(|max| {
                reasons.push(format!("entry count {entry_count} exceeds max {max}"));
                entry_count - max + self.config.headroom(max)
            });

        Ok(PressureReport {
            needed: !reasons.is_empty(),
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
            entry_count,
            total_tokens,
            token_target,
            count_target,
        })
    }

    /// Evict to relieve pressure, with headroom. `None` when under every
    /// ceiling.
    ///
    /// The token ceiling is relieved first. If the entry ceiling is still
    /// exceeded afterwards, a second count-targeted sweep runs.
    pub async fn auto_evict(&self, session_active: bool) -> Result<Option<EvictionResult>> {
        let report = self.needs_eviction().await?;
        let Some(reason) = report.reason else {
            return Ok(None);
        };

        let mut combined: Option<EvictionResult> = None;
        if let Some(target) = report.token_target {
            let request = EvictionRequest::tokens(target)
                .with_session_active(session_active)
                .with_reason(reason.clone());
            combined = Some(self.evict(&request).await?);
        }

        let count_target = if combined.is_some() {
            self.needs_eviction().await?.count_target
        } else {
            report.count_target
        };
        if let Some(target) = count_target {
            let request = EvictionRequest::count(target)
                .with_session_active(session_active)
                .with_reason(reason.clone());
            let result = self.evict(&request).await?;
            match combined.as_mut() {
                Some(acc) => acc.absorb(result),
                None => combined = Some(result),
            }
        }

        Ok(combined)
    }

    /// Record an access to a memory entry and persist its new score.
    pub async fn record_access(&self, id: &str) -> Result<MemoryEntry> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StintError::not_found("memory entry", id))?;
        entry.touch(Utc::now());
        self.store.update(entry.clone()).await?;
        Ok(entry)
    }
}

struct Candidate {
    entry: MemoryEntry,
    /// Score refreshed at sweep time.
    score: f64,
}

fn compare(strategy: EvictionStrategy, a: &Candidate, b: &Candidate) -> Ordering {
    let primary = match strategy {
        EvictionStrategy::Lru => a.entry.last_accessed.cmp(&b.entry.last_accessed),
        EvictionStrategy::Lfu => a.entry.access_count.cmp(&b.entry.access_count),
        EvictionStrategy::Fifo => a.entry.created_at.cmp(&b.entry.created_at),
        EvictionStrategy::Weighted => a.score.total_cmp(&b.score),
    };
    primary.then_with(|| a.entry.id.cmp(&b.entry.id))
}
