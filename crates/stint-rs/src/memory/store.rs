//! Memory store collaborator and an in-process implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use super::priority::{MemoryEntry, MemoryPriority};
use crate::error::{Result, StintError};

/// Boxed future returned by [`MemoryStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage for memory entries.
///
/// `fetch_evictable` returns every entry in scope, pinned ones included; the
/// eviction engine does the filtering so it can report skipped counts.
pub trait MemoryStore: Send + Sync {
    fn insert(&self, entry: MemoryEntry) -> StoreFuture<'_, ()>;
    fn fetch_evictable(&self, tenant_id: Option<&str>) -> StoreFuture<'_, Vec<MemoryEntry>>;
    /// Delete every id in one batch. Returns how many were removed.
    fn delete_batch(&self, ids: &[String]) -> StoreFuture<'_, usize>;
    fn count(&self) -> StoreFuture<'_, u64>;
    fn total_size(&self) -> StoreFuture<'_, u64>;
    fn pinned_size(&self, tenant_id: &str) -> StoreFuture<'_, u64>;
    fn fetch_pinned(&self, tenant_id: &str) -> StoreFuture<'_, Vec<MemoryEntry>>;
    fn get(&self, id: &str) -> StoreFuture<'_, Option<MemoryEntry>>;
    /// Replace an existing entry. Missing ids are a not-found error.
    fn update(&self, entry: MemoryEntry) -> StoreFuture<'_, ()>;
}

/// Map-backed store, ordered by id.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut BTreeMap<String, MemoryEntry>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut entries)
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn insert(&self, entry: MemoryEntry) -> StoreFuture<'_, ()> {
        let result = self.with_entries(|entries| {
            if entries.contains_key(&entry.id) {
                return Err(StintError::Store(format!(
                    "memory entry {} already exists",
                    entry.id
                )));
            }
            entries.insert(entry.id.clone(), entry);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn fetch_evictable(&self, tenant_id: Option<&str>) -> StoreFuture<'_, Vec<MemoryEntry>> {
        let tenant_id = tenant_id.map(str::to_string);
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                entries
                    .values()
                    .filter(|e| tenant_id.as_deref().is_none_or(|t| e.tenant_id == t))
                    .cloned()
                    .collect()
            }))
        })
    }

    fn delete_batch(&self, ids: &[String]) -> StoreFuture<'_, usize> {
        let ids = ids.to_vec();
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                ids.iter().filter(|id| entries.remove(*id).is_some()).count()
            }))
        })
    }

    fn count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.with_entries(|entries| entries.len() as u64)) })
    }

    fn total_size(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            Ok(self.with_entries(|entries| entries.values().map(|e| e.size_tokens).sum()))
        })
    }

    fn pinned_size(&self, tenant_id: &str) -> StoreFuture<'_, u64> {
        let tenant_id = tenant_id.to_string();
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                entries
                    .values()
                    .filter(|e| e.priority == MemoryPriority::Pinned && e.tenant_id == tenant_id)
                    .map(|e| e.size_tokens)
                    .sum()
            }))
        })
    }

    fn fetch_pinned(&self, tenant_id: &str) -> StoreFuture<'_, Vec<MemoryEntry>> {
        let tenant_id = tenant_id.to_string();
        Box::pin(async move {
            Ok(self.with_entries(|entries| {
                entries
                    .values()
                    .filter(|e| e.priority == MemoryPriority::Pinned && e.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn get(&self, id: &str) -> StoreFuture<'_, Option<MemoryEntry>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.with_entries(|entries| entries.get(&id).cloned())) })
    }

    fn update(&self, entry: MemoryEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_entries(|entries| match entries.get_mut(&entry.id) {
                Some(slot) => {
                    *slot = entry;
                    Ok(())
                }
                None => Err(StintError::not_found("memory entry", entry.id)),
            })
        })
    }
}
