//! Episodes: bounded units of agent work with their own budget and lifecycle.
//!
//! The [`EpisodeService`] drives an [`Episode`] through the lifecycle graph
//! in [`state`], opening a [`Session`] (and with it a budget tracker) while
//! the episode runs. Episodes reference parents and children by id only.

pub mod service;
pub mod session;
pub mod state;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::{BudgetConfig, BudgetState, SubBudgetOptions};

pub use service::EpisodeService;
pub use session::{InMemorySessionManager, Session, SessionFuture, SessionManager};
pub use state::{EpisodeStatus, EpisodeTransition};
pub use store::{EpisodeStore, FileEpisodeStore, InMemoryEpisodeStore};

/// Open string-keyed map of opaque values.
pub type Metadata = serde_json::Map<String, Value>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: String,
    pub agent_id: String,
    pub task_type: String,
    pub tenant_id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_ids: Vec<String>,
    pub status: EpisodeStatus,
    pub budget: BudgetConfig,
    #[serde(default)]
    pub budget_state: BudgetState,
    pub input: Value,
    pub output: Option<Value>,
    pub checkpoint: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Parameters for [`EpisodeService::create_episode`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEpisode {
    pub agent_id: String,
    pub task_type: String,
    pub tenant_id: String,
    pub input: Value,
    /// Falls back to the service's default budget.
    pub budget: Option<BudgetConfig>,
    pub metadata: Metadata,
}

impl NewEpisode {
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            tenant_id: tenant_id.into(),
            input: Value::Null,
            budget: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Parameters for [`EpisodeService::spawn_subcall`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubcallRequest {
    /// Defaults to the parent's agent.
    pub agent_id: Option<String>,
    pub task_type: String,
    pub input: Value,
    /// Falls back to the service's subcall defaults.
    pub options: Option<SubBudgetOptions>,
    pub metadata: Metadata,
}

impl SubcallRequest {
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            agent_id: None,
            task_type: task_type.into(),
            input,
            options: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_options(mut self, options: SubBudgetOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Filter for [`EpisodeStore::list`]. Unset fields match everything.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EpisodeFilter {
    pub status: Option<EpisodeStatus>,
    pub agent_id: Option<String>,
    pub task_type: Option<String>,
    pub parent_id: Option<String>,
    pub limit: Option<usize>,
}

impl EpisodeFilter {
    pub fn with_status(mut self, status: EpisodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, episode: &Episode) -> bool {
        self.status.is_none_or(|s| episode.status == s)
            && self
                .agent_id
                .as_deref()
                .is_none_or(|a| episode.agent_id == a)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| episode.task_type == t)
            && self
                .parent_id
                .as_deref()
                .is_none_or(|p| episode.parent_id.as_deref() == Some(p))
    }

    /// Filter, order by creation (then id), and truncate to the limit.
    pub(crate) fn apply(&self, episodes: impl IntoIterator<Item = Episode>) -> Vec<Episode> {
        let mut matched: Vec<Episode> = episodes.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}
