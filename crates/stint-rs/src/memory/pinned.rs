//! Curated never-evict context, capped per tenant.
//!
//! Pinned entries live in the same [`MemoryStore`] as everything else, at
//! [`MemoryPriority::Pinned`], so the eviction engine sees and skips them.
//! Writes through one [`PinnedContextManager`] are serialized, which keeps
//! each tenant's pinned total within budget under concurrent writers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::priority::{MemoryEntry, MemoryPriority, PINNED_EVICTION_SCORE, PinInfo};
use super::store::MemoryStore;
use crate::error::{Result, StintError};
use crate::ids::generate_id;
use crate::tokens::TokenEstimator;

/// Default pinned budget per tenant, in tokens.
pub const DEFAULT_PINNED_BUDGET: u64 = 2000;

// ── Categories ─────────────────────────────────────────────────────

/// Pinned content categories, in injection order.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum PinnedCategory {
    BrandVoice,
    ToneGuidelines,
    ComplianceRules,
    ProhibitedTopics,
    LegalDisclaimers,
}

impl PinnedCategory {
    pub const ALL: [PinnedCategory; 5] = [
        PinnedCategory::BrandVoice,
        PinnedCategory::ToneGuidelines,
        PinnedCategory::ComplianceRules,
        PinnedCategory::ProhibitedTopics,
        PinnedCategory::LegalDisclaimers,
    ];

    /// Section header used when rendering injection context.
    pub fn header(&self) -> &'static str {
        match self {
            PinnedCategory::BrandVoice => "## Brand Voice",
            PinnedCategory::ToneGuidelines => "## Tone Guidelines",
            PinnedCategory::ComplianceRules => "## Compliance Rules",
            PinnedCategory::ProhibitedTopics => "## Prohibited Topics",
            PinnedCategory::LegalDisclaimers => "## Legal Disclaimers",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PinnedCategory::BrandVoice => "brand_voice",
            PinnedCategory::ToneGuidelines => "tone_guidelines",
            PinnedCategory::ComplianceRules => "compliance_rules",
            PinnedCategory::ProhibitedTopics => "prohibited_topics",
            PinnedCategory::LegalDisclaimers => "legal_disclaimers",
        }
    }
}

impl fmt::Display for PinnedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Config ─────────────────────────────────────────────────────────

/// Per-tenant pinned budgets.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PinnedConfig {
    pub default_budget: u64,
    /// Overrides keyed by tenant id.
    pub tenant_budgets: BTreeMap<String, u64>,
}

impl Default for PinnedConfig {
    fn default() -> Self {
        Self {
            default_budget: DEFAULT_PINNED_BUDGET,
            tenant_budgets: BTreeMap::new(),
        }
    }
}

impl PinnedConfig {
    pub fn with_default_budget(mut self, budget: u64) -> Self {
        self.default_budget = budget;
        self
    }

    pub fn with_tenant_budget(mut self, tenant_id: impl Into<String>, budget: u64) -> Self {
        self.tenant_budgets.insert(tenant_id.into(), budget);
        self
    }

    pub fn budget_for(&self, tenant_id: &str) -> u64 {
        self.tenant_budgets
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_budget)
    }
}

// ── Requests & reports ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PinRequest {
    pub tenant_id: String,
    pub category: PinnedCategory,
    pub label: String,
    pub content: String,
}

impl PinRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        category: PinnedCategory,
        label: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            category,
            label: label.into(),
            content: content.into(),
        }
    }
}

/// Changes to a pinned entry. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinUpdate {
    pub label: Option<String>,
    pub content: Option<String>,
}

impl PinUpdate {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            content: None,
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            label: None,
            content: Some(content.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PinnedUsage {
    pub tenant_id: String,
    pub used: u64,
    pub budget: u64,
    pub remaining: u64,
    pub entries: usize,
}

/// Default content seeded by [`PinnedContextManager::initialize_client`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClientDefaults {
    pub brand_voice: Option<String>,
    pub compliance_rules: Option<String>,
}

// ── Observers ──────────────────────────────────────────────────────

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PinnedEvent {
    Pinned {
        tenant_id: String,
        id: String,
        category: PinnedCategory,
        size_tokens: u64,
    },
    Updated {
        tenant_id: String,
        id: String,
        category: PinnedCategory,
        size_tokens: u64,
    },
    Unpinned {
        tenant_id: String,
        id: String,
        category: PinnedCategory,
        size_tokens: u64,
    },
}

pub trait PinnedObserver: Send + Sync {
    fn on_pinned_event(&self, event: &PinnedEvent);
}

// ── Manager ────────────────────────────────────────────────────────

pub struct PinnedContextManager {
    store: Arc<dyn MemoryStore>,
    estimator: TokenEstimator,
    config: PinnedConfig,
    observers: Vec<Arc<dyn PinnedObserver>>,
    writes: Mutex<()>,
}

impl PinnedContextManager {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            estimator: TokenEstimator::default(),
            config: PinnedConfig::default(),
            observers: Vec::new(),
            writes: Mutex::new(()),
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_config(mut self, config: PinnedConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PinnedObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &PinnedConfig {
        &self.config
    }

    fn notify(&self, event: PinnedEvent) {
        for observer in &self.observers {
            observer.on_pinned_event(&event);
        }
    }

    /// Pin new content. Rejected if it would overflow the tenant's budget.
    pub async fn pin(&self, request: PinRequest) -> Result<MemoryEntry> {
        let _writes = self.writes.lock().await;
        self.pin_unlocked(request).await
    }

    async fn pin_unlocked(&self, request: PinRequest) -> Result<MemoryEntry> {
        let size = self.estimator.estimate(&request.content);
        let used = self.store.pinned_size(&request.tenant_id).await?;
        let budget = self.config.budget_for(&request.tenant_id);
        if used.saturating_add(size) > budget {
            return Err(StintError::PinnedBudgetExceeded {
                tenant_id: request.tenant_id,
                requested: size,
                used,
                budget,
            });
        }

        let now = Utc::now();
        let mut entry = MemoryEntry::new(
            generate_id("pin"),
            request.tenant_id,
            MemoryPriority::Pinned,
            size,
            now,
        )
        .with_content(request.content);
        entry.eviction_score = PINNED_EVICTION_SCORE;
        entry.pin = Some(PinInfo {
            category: request.category,
            label: request.label,
        });
        self.store.insert(entry.clone()).await?;

        info!(
            "pinned {} ({}, {size} tokens) for tenant {}: {}/{budget} used",
            entry.id,
            request.category,
            entry.tenant_id,
            used + size
        );
        self.notify(PinnedEvent::Pinned {
            tenant_id: entry.tenant_id.clone(),
            id: entry.id.clone(),
            category: request.category,
            size_tokens: size,
        });
        Ok(entry)
    }

    /// Update label and/or content. Only a content change is re-checked
    /// against the budget, as old size out and new size in.
    pub async fn update(&self, tenant_id: &str, id: &str, update: PinUpdate) -> Result<MemoryEntry> {
        let _writes = self.writes.lock().await;
        let mut entry = self.scoped(tenant_id, id).await?;
        let category = pin_category(&entry)?;

        if let Some(content) = update.content {
            let new_size = self.estimator.estimate(&content);
            let others = self
                .store
                .pinned_size(tenant_id)
                .await?
                .saturating_sub(entry.size_tokens);
            let budget = self.config.budget_for(tenant_id);
            if others.saturating_add(new_size) > budget {
                return Err(StintError::PinnedBudgetExceeded {
                    tenant_id: tenant_id.to_string(),
                    requested: new_size,
                    used: others,
                    budget,
                });
            }
            entry.content = content;
            entry.size_tokens = new_size;
        }
        if let Some(label) = update.label
            && let Some(pin) = entry.pin.as_mut()
        {
            pin.label = label;
        }

        self.store.update(entry.clone()).await?;
        debug!("updated pinned entry {id} for tenant {tenant_id}");
        self.notify(PinnedEvent::Updated {
            tenant_id: tenant_id.to_string(),
            id: entry.id.clone(),
            category,
            size_tokens: entry.size_tokens,
        });
        Ok(entry)
    }

    /// Remove a pinned entry, freeing its budget.
    pub async fn unpin(&self, tenant_id: &str, id: &str) -> Result<MemoryEntry> {
        let _writes = self.writes.lock().await;
        let entry = self.scoped(tenant_id, id).await?;
        let category = pin_category(&entry)?;
        self.store.delete_batch(&[entry.id.clone()]).await?;
        info!("unpinned {id} for tenant {tenant_id}");
        self.notify(PinnedEvent::Unpinned {
            tenant_id: tenant_id.to_string(),
            id: entry.id.clone(),
            category,
            size_tokens: entry.size_tokens,
        });
        Ok(entry)
    }

    /// Fetch a pinned entry. Another tenant's id yields `None`.
    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<MemoryEntry>> {
        Ok(self
            .store
            .get(id)
            .await?
            .filter(|e| e.tenant_id == tenant_id && e.is_pinned()))
    }

    async fn scoped(&self, tenant_id: &str, id: &str) -> Result<MemoryEntry> {
        self.get(tenant_id, id)
            .await?
            .ok_or_else(|| StintError::not_found("pinned entry", id))
    }

    /// A tenant's pinned entries in category order, then creation order.
    pub async fn list(
        &self,
        tenant_id: &str,
        category: Option<PinnedCategory>,
    ) -> Result<Vec<MemoryEntry>> {
        let mut entries: Vec<MemoryEntry> = self
            .store
            .fetch_pinned(tenant_id)
            .await?
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| {
                category.is_none_or(|c| e.pin.as_ref().is_some_and(|p| p.category == c))
            })
            .collect();
        entries.sort_by(|a, b| {
            let ca = a.pin.as_ref().map(|p| p.category);
            let cb = b.pin.as_ref().map(|p| p.category);
            ca.cmp(&cb)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries)
    }

    pub async fn usage(&self, tenant_id: &str) -> Result<PinnedUsage> {
        let entries = self.store.fetch_pinned(tenant_id).await?;
        let used: u64 = entries.iter().map(|e| e.size_tokens).sum();
        let budget = self.config.budget_for(tenant_id);
        Ok(PinnedUsage {
            tenant_id: tenant_id.to_string(),
            used,
            budget,
            remaining: budget.saturating_sub(used),
            entries: entries.len(),
        })
    }

    /// Render a tenant's pinned content for injection into agent context.
    ///
    /// Sections follow [`PinnedCategory::ALL`] order; categories with no
    /// entries are omitted. Each entry renders its label as a sub-header and
    /// its raw content beneath. A tenant with nothing pinned renders as an
    /// empty string.
    pub async fn get_injection_context(
        &self,
        tenant_id: &str,
        categories: Option<&[PinnedCategory]>,
    ) -> Result<String> {
        let entries = self.list(tenant_id, None).await?;
        let mut sections = Vec::new();

        for category in PinnedCategory::ALL {
            if categories.is_some_and(|wanted| !wanted.contains(&category)) {
                continue;
            }
            let body: Vec<String> = entries
                .iter()
                .filter_map(|e| {
                    let pin = e.pin.as_ref()?;
                    (pin.category == category).then(|| format!("### {}\n{}", pin.label, e.content))
                })
                .collect();
            if body.is_empty() {
                continue;
            }
            sections.push(format!("{}\n\n{}", category.header(), body.join("\n\n")));
        }

        Ok(sections.join("\n\n"))
    }

    /// Estimated size of [`get_injection_context`](Self::get_injection_context)'s output.
    pub async fn estimate_injection_tokens(
        &self,
        tenant_id: &str,
        categories: Option<&[PinnedCategory]>,
    ) -> Result<u64> {
        let rendered = self.get_injection_context(tenant_id, categories).await?;
        Ok(self.estimator.estimate(&rendered))
    }

    /// Seed default brand voice and compliance rules for a tenant.
    ///
    /// A default is inserted only when its category is empty; existing
    /// content is never overwritten, so repeated calls are no-ops.
    pub async fn initialize_client(
        &self,
        tenant_id: &str,
        defaults: &ClientDefaults,
    ) -> Result<Vec<MemoryEntry>> {
        let _writes = self.writes.lock().await;
        let existing = self.store.fetch_pinned(tenant_id).await?;
        let seeds = [
            (
                PinnedCategory::BrandVoice,
                "Default brand voice",
                &defaults.brand_voice,
            ),
            (
                PinnedCategory::ComplianceRules,
                "Default compliance rules",
                &defaults.compliance_rules,
            ),
        ];

        let mut created = Vec::new();
        for (category, label, content) in seeds {
            let Some(content) = content else { continue };
            let occupied = existing
                .iter()
                .any(|e| e.pin.as_ref().is_some_and(|p| p.category == category));
            if occupied {
                continue;
            }
            let request = PinRequest::new(tenant_id, category, label, content.clone());
            created.push(self.pin_unlocked(request).await?);
        }
        Ok(created)
    }
}

fn pin_category(entry: &MemoryEntry) -> Result<PinnedCategory> {
    entry
        .pin
        .as_ref()
        .map(|p| p.category)
        .ok_or_else(|| StintError::Store(format!("pinned entry {} has no category", entry.id)))
}
