//! Time-bounded cache for read results.
//!
//! This module provides the read side of the resilience layer:
//! - Stores serialized read results keyed by `{resource}_{scope}_{page}`
//! - Expires entries lazily on read once their TTL has elapsed
//! - Supports scoped invalidation by key prefix after a mutation
//! - Caps the number of entries with FIFO eviction

mod store;
mod types;

pub use store::{
  ResultCache, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_ENTRIES, DEFAULT_TTL, MAX_TTL,
};
pub use types::{CacheEntry, CacheKey, CacheResult, CacheSource, CacheStats};
