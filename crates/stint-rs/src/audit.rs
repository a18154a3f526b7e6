//! Audit trail for episode lifecycle changes and evictions.
//!
//! Emission is fire-and-forget: an [`AuditEmitter`] cannot fail the
//! operation that produced the record.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::episode::Metadata;

/// Boxed future returned by [`AuditEmitter::emit`].
pub type AuditFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// What happened.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    EpisodeCreated,
    EpisodeStarted,
    EpisodeSuspended,
    EpisodeResumed,
    EpisodeCompleted,
    EpisodeFailed,
    EpisodeRetried,
    SubcallSpawned,
    MemoryEvicted,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::EpisodeCreated => "episode_created",
            AuditKind::EpisodeStarted => "episode_started",
            AuditKind::EpisodeSuspended => "episode_suspended",
            AuditKind::EpisodeResumed => "episode_resumed",
            AuditKind::EpisodeCompleted => "episode_completed",
            AuditKind::EpisodeFailed => "episode_failed",
            AuditKind::EpisodeRetried => "episode_retried",
            AuditKind::SubcallSpawned => "subcall_spawned",
            AuditKind::MemoryEvicted => "memory_evicted",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub kind: AuditKind,
    /// Who acted (agent id, or `"system"` for engine-driven actions).
    pub actor: String,
    /// What was acted on (episode id, memory entry id).
    pub target: String,
    pub metadata: Metadata,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, actor: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            target: target.into(),
            metadata: Metadata::new(),
            at: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_time(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Sink for audit records.
pub trait AuditEmitter: Send + Sync {
    fn emit(&self, event: AuditEvent) -> AuditFuture<'_>;
}

/// Writes audit records as `tracing` events on the `stint::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditEmitter;

impl AuditEmitter for TracingAuditEmitter {
    fn emit(&self, event: AuditEvent) -> AuditFuture<'_> {
        Box::pin(async move {
            let metadata = serde_json::Value::Object(event.metadata);
            info!(
                target: "stint::audit",
                kind = %event.kind,
                actor = %event.actor,
                target_id = %event.target,
                metadata = %metadata,
                "audit"
            );
        })
    }
}

/// Drops every record.
#[derive(Debug, Default)]
pub struct NoopAuditEmitter;

impl AuditEmitter for NoopAuditEmitter {
    fn emit(&self, _event: AuditEvent) -> AuditFuture<'_> {
        Box::pin(async {})
    }
}

/// Keeps every record in memory. Used by tests and the `simulate` command.
#[derive(Debug, Default)]
pub struct RecordingAuditEmitter {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl AuditEmitter for RecordingAuditEmitter {
    fn emit(&self, event: AuditEvent) -> AuditFuture<'_> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_emitter_keeps_order() {
        let audit = RecordingAuditEmitter::new();
        audit
            .emit(AuditEvent::new(AuditKind::EpisodeCreated, "agent", "ep-1"))
            .await;
        audit
            .emit(AuditEvent::new(AuditKind::EpisodeStarted, "agent", "ep-1").with_field("n", 1))
            .await;
        assert_eq!(
            audit.kinds(),
            vec![AuditKind::EpisodeCreated, AuditKind::EpisodeStarted]
        );
        assert_eq!(audit.of_kind(AuditKind::EpisodeStarted)[0].metadata["n"], 1);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&AuditKind::MemoryEvicted).unwrap();
        assert_eq!(json, "\"memory_evicted\"");
        assert_eq!(AuditKind::SubcallSpawned.to_string(), "subcall_spawned");
    }

    #[tokio::test]
    async fn tracing_emitter_does_not_panic_without_subscriber() {
        TracingAuditEmitter
            .emit(AuditEvent::new(AuditKind::EpisodeFailed, "a", "t").with_field("error", "x"))
            .await;
    }
}
