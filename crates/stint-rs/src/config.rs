//! Runtime configuration with sensible defaults.
//!
//! [`StintConfig`] is loaded from JSON, validated structurally against its
//! own generated JSON schema and semantically for value ranges, and then
//! turned into configured components via the `build_*` methods.

use std::path::Path;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::audit::AuditEmitter;
use crate::budget::{BudgetConfig, DEFAULT_WARNING_THRESHOLD, SubBudgetOptions};
use crate::episode::{EpisodeService, EpisodeStore, InMemorySessionManager, SessionManager};
use crate::error::{Result, StintError};
use crate::json_schema_for;
use crate::memory::{EvictionConfig, EvictionEngine, MemoryStore, PinnedConfig, PinnedContextManager};
use crate::tokens::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};

/// Top-level configuration. Every field has a default, so `{}` is valid.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StintConfig {
    /// Budget for episodes created without one. Default: unbounded.
    pub default_budget: BudgetConfig,
    /// Fraction of a ceiling at which a warning fires. Default: `0.8`.
    pub warning_threshold: f64,
    /// Child budget derivation for subcalls. Default: half of remaining.
    pub subcall: SubBudgetOptions,
    pub eviction: EvictionConfig,
    pub pinned: PinnedConfig,
    /// Ratio used by the default token estimator. Default: `3.5`.
    pub chars_per_token: f64,
    /// Optional JSON schema for episode metadata.
    pub metadata_schema: Option<Value>,
}

impl Default for StintConfig {
    fn default() -> Self {
        Self {
            default_budget: BudgetConfig::unbounded(),
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            subcall: SubBudgetOptions::default(),
            eviction: EvictionConfig::default(),
            pinned: PinnedConfig::default(),
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            metadata_schema: None,
        }
    }
}

impl StintConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StintError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&text)?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        validate_against_schema(&value)?;
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            problems.push(format!(
                "warning_threshold must be in (0, 1], got {}",
                self.warning_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.subcall.fraction) {
            problems.push(format!(
                "subcall.fraction must be in [0, 1], got {}",
                self.subcall.fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.eviction.headroom_fraction) {
            problems.push(format!(
                "eviction.headroom_fraction must be in [0, 1], got {}",
                self.eviction.headroom_fraction
            ));
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            problems.push(format!(
                "chars_per_token must be positive, got {}",
                self.chars_per_token
            ));
        }
        if let Some(schema) = &self.metadata_schema
            && let Err(e) = jsonschema::validator_for(schema)
        {
            problems.push(format!("metadata_schema is not a valid JSON schema: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StintError::Config(problems.join("; ")))
        }
    }

    pub fn with_default_budget(mut self, budget: BudgetConfig) -> Self {
        self.default_budget = budget;
        self
    }

    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_pinned(mut self, pinned: PinnedConfig) -> Self {
        self.pinned = pinned;
        self
    }

    // ── Builders ───────────────────────────────────────────────────

    pub fn build_estimator(&self) -> TokenEstimator {
        TokenEstimator::chars_per_token(self.chars_per_token)
    }

    pub fn build_session_manager(&self) -> InMemorySessionManager {
        InMemorySessionManager::new()
            .with_warning_threshold(self.warning_threshold)
            .with_estimator(self.build_estimator())
    }

    pub fn build_episode_service(
        &self,
        store: Arc<dyn EpisodeStore>,
        sessions: Arc<dyn SessionManager>,
        audit: Arc<dyn AuditEmitter>,
    ) -> EpisodeService {
        let service = EpisodeService::new(store, sessions, audit)
            .with_default_budget(self.default_budget.clone())
            .with_subcall_defaults(self.subcall.clone());
        match &self.metadata_schema {
            Some(schema) => service.with_metadata_schema(schema.clone()),
            None => service,
        }
    }

    pub fn build_eviction_engine(
        &self,
        store: Arc<dyn MemoryStore>,
        audit: Arc<dyn AuditEmitter>,
    ) -> EvictionEngine {
        EvictionEngine::new(store, audit)
            .with_config(self.eviction.clone())
            .with_pinned_config(self.pinned.clone())
    }

    pub fn build_pinned_manager(&self, store: Arc<dyn MemoryStore>) -> PinnedContextManager {
        PinnedContextManager::new(store)
            .with_estimator(self.build_estimator())
            .with_config(self.pinned.clone())
    }
}

/// Check `value` against the generated [`StintConfig`] schema.
fn validate_against_schema(value: &Value) -> Result<()> {
    let schema = json_schema_for::<StintConfig>();
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| StintError::Config(format!("config schema failed to compile: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StintError::Config(format!(
            "config does not match schema:\n{}",
            errors.join("\n")
        )))
    }
}
