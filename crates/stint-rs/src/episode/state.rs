//! Episode lifecycle graph.
//!
//! ```text
//!            start            complete
//! created ─────────► running ─────────► completed
//!                    │    ▲
//!            suspend │    │ resume
//!                    ▼    │
//!                  suspended
//!
//! running | suspended ── fail ──► failed ── retry ──► (new episode, created)
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StintError};

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl EpisodeStatus {
    pub const ALL: [EpisodeStatus; 5] = [
        EpisodeStatus::Created,
        EpisodeStatus::Running,
        EpisodeStatus::Suspended,
        EpisodeStatus::Completed,
        EpisodeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Created => "created",
            EpisodeStatus::Running => "running",
            EpisodeStatus::Suspended => "suspended",
            EpisodeStatus::Completed => "completed",
            EpisodeStatus::Failed => "failed",
        }
    }

    /// No further transitions on this episode itself. A failed episode can
    /// still spawn a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpisodeStatus::Completed | EpisodeStatus::Failed)
    }

    /// Status reached by applying `transition`.
    ///
    /// For [`EpisodeTransition::Retry`] this is the status of the *new*
    /// episode; the failed one stays failed.
    pub fn apply(self, transition: EpisodeTransition) -> Result<EpisodeStatus> {
        use EpisodeStatus::*;
        use EpisodeTransition::*;
        let next = match (self, transition) {
            (Created, Start) => Running,
            (Running, Suspend) => Suspended,
            (Suspended, Resume) => Running,
            (Running, Complete) => Completed,
            (Running | Suspended, Fail) => Failed,
            (Failed, Retry) => Created,
            (from, requested) => {
                return Err(StintError::InvalidTransition { from, requested });
            }
        };
        Ok(next)
    }

    pub fn can(self, transition: EpisodeTransition) -> bool {
        self.apply(transition).is_ok()
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeTransition {
    Start,
    Suspend,
    Resume,
    Complete,
    Fail,
    Retry,
}

impl EpisodeTransition {
    pub const ALL: [EpisodeTransition; 6] = [
        EpisodeTransition::Start,
        EpisodeTransition::Suspend,
        EpisodeTransition::Resume,
        EpisodeTransition::Complete,
        EpisodeTransition::Fail,
        EpisodeTransition::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeTransition::Start => "start",
            EpisodeTransition::Suspend => "suspend",
            EpisodeTransition::Resume => "resume",
            EpisodeTransition::Complete => "complete",
            EpisodeTransition::Fail => "fail",
            EpisodeTransition::Retry => "retry",
        }
    }
}

impl fmt::Display for EpisodeTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
