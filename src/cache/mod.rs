//! Query cache shared by every entity feature.
//!
//! This module provides an entity-agnostic cache that:
//! - Keys list results structurally by entity name, filters and pagination
//! - Serves fresh entries without a request and refetches stale ones
//! - Lets only the latest request for a key commit its result
//! - Applies optimistic patches that can be rolled back exactly
//! - Invalidates all pages of an entity at once after a mutation

mod memory;
mod storage;
mod store;
mod traits;

pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use store::{apply_patch, PatchOp, QueryCacheStore, Revert};
pub use traits::{CacheEntry, CacheResult, CacheSource, QueryKey};
