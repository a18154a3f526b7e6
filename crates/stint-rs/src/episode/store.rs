//! Episode persistence.
//!
//! [`InMemoryEpisodeStore`] for tests and simulations; [`FileEpisodeStore`]
//! keeps one JSON document per episode, written atomically.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{Episode, EpisodeFilter};
use crate::error::{Result, StintError};

/// Boxed future returned by [`EpisodeStore`] methods.
pub type EpisodeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait EpisodeStore: Send + Sync {
    /// Insert a new episode. Duplicate ids are a store error.
    fn insert(&self, episode: Episode) -> EpisodeFuture<'_, ()>;
    /// Replace an existing episode. Missing ids are a not-found error.
    fn update(&self, episode: Episode) -> EpisodeFuture<'_, ()>;
    fn get(&self, id: &str) -> EpisodeFuture<'_, Option<Episode>>;
    /// A tenant's episodes matching `filter`, oldest first.
    fn list(&self, tenant_id: &str, filter: &EpisodeFilter) -> EpisodeFuture<'_, Vec<Episode>>;
}

// ── In-memory ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryEpisodeStore {
    episodes: Mutex<HashMap<String, Episode>>,
}

impl InMemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn episodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Episode>> {
        self.episodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EpisodeStore for InMemoryEpisodeStore {
    fn insert(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
        let result = {
            let mut episodes = self.episodes();
            if episodes.contains_key(&episode.id) {
                Err(StintError::Store(format!("episode {} already exists", episode.id)))
            } else {
                episodes.insert(episode.id.clone(), episode);
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn update(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
        let result = match self.episodes().get_mut(&episode.id) {
            Some(slot) => {
                *slot = episode;
                Ok(())
            }
            None => Err(StintError::not_found("episode", episode.id)),
        };
        Box::pin(async move { result })
    }

    fn get(&self, id: &str) -> EpisodeFuture<'_, Option<Episode>> {
        let found = self.episodes().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list(&self, tenant_id: &str, filter: &EpisodeFilter) -> EpisodeFuture<'_, Vec<Episode>> {
        let listed = filter.apply(
            self.episodes()
                .values()
                .filter(|e| e.tenant_id == tenant_id)
                .cloned()
                .collect::<Vec<_>>(),
        );
        Box::pin(async move { Ok(listed) })
    }
}

// ── File-backed ────────────────────────────────────────────────────

/// One `{id}.json` file per episode under a root directory.
///
/// ```text
/// episodes/
///   ep-18c2f0a1b2c3d4e5-0000.json
///   ep-18c2f0a1b2c3d4e6-0001.json
/// ```
#[derive(Debug, Clone)]
pub struct FileEpisodeStore {
    dir: PathBuf,
}

impl FileEpisodeStore {
    /// Create the store, ensuring the root directory exists.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StintError::InvalidInput(format!("invalid episode id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    async fn write(&self, episode: &Episode) -> Result<()> {
        let path = self.path_for(&episode.id)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", episode.id));
        let json = serde_json::to_vec_pretty(episode)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("wrote episode {} to {}", episode.id, path.display());
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Episode>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl EpisodeStore for FileEpisodeStore {
    fn insert(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
        Box::pin(async move {
            if self.read(&episode.id).await?.is_some() {
                return Err(StintError::Store(format!(
                    "episode {} already exists",
                    episode.id
                )));
            }
            self.write(&episode).await
        })
    }

    fn update(&self, episode: Episode) -> EpisodeFuture<'_, ()> {
        Box::pin(async move {
            if self.read(&episode.id).await?.is_none() {
                return Err(StintError::not_found("episode", episode.id));
            }
            self.write(&episode).await
        })
    }

    fn get(&self, id: &str) -> EpisodeFuture<'_, Option<Episode>> {
        let id = id.to_string();
        Box::pin(async move { self.read(&id).await })
    }

    fn list(&self, tenant_id: &str, filter: &EpisodeFilter) -> EpisodeFuture<'_, Vec<Episode>> {
        let tenant_id = tenant_id.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            let mut episodes = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_json = path.extension().is_some_and(|ext| ext == "json");
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !is_json || hidden {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<Episode>(&bytes) {
                    Ok(episode) if episode.tenant_id == tenant_id => episodes.push(episode),
                    Ok(_) => {}
                    Err(e) => warn!("skipping unreadable episode file {}: {e}", path.display()),
                }
            }
            Ok(filter.apply(episodes))
        })
    }
}
