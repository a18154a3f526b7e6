//! Tiered agent memory: priorities, storage, eviction, and pinned context.
//!
//! Entries carry a [`MemoryPriority`] tier. The [`EvictionEngine`] keeps a
//! [`MemoryStore`] within its ceilings by evicting from the lowest tiers
//! first and never touching pinned content. The [`PinnedContextManager`]
//! curates the pinned tier under a per-tenant budget and renders it for
//! injection into agent context.

pub mod eviction;
pub mod pinned;
pub mod priority;
pub mod store;

pub use eviction::{
    EvictionConfig, EvictionEngine, EvictionRequest, EvictionResult, EvictionStrategy,
    EvictionTarget, PressureReport,
};
pub use pinned::{
    ClientDefaults, PinRequest, PinUpdate, PinnedCategory, PinnedConfig, PinnedContextManager,
    PinnedEvent, PinnedObserver, PinnedUsage,
};
pub use priority::{MemoryEntry, MemoryPriority, PINNED_EVICTION_SCORE, PinInfo, eviction_score};
pub use store::{InMemoryMemoryStore, MemoryStore, StoreFuture};
