//! Core types for the read cache.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// A stored read result.
///
/// Valid while `now - stored_at < ttl`. Expired entries are never returned.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(self.stored_at).to_std() {
      Ok(age) => age < self.ttl,
      // Clock moved backwards since the entry was stored
      Err(_) => true,
    }
  }
}

/// Cache key following the `{resource_type}_{scope_id}_{page}` convention.
///
/// Mutations touching a scope invalidate every page of it through
/// [`CacheKey::scope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  resource_type: String,
  scope_id: String,
  page: u32,
}

impl CacheKey {
  pub fn new(resource_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
    Self {
      resource_type: resource_type.into(),
      scope_id: scope_id.into(),
      page: 0,
    }
  }

  pub fn page(mut self, page: u32) -> Self {
    self.page = page;
    self
  }

  /// The `{resource_type}_{scope_id}` prefix shared by all pages.
  pub fn scope(&self) -> String {
    format!("{}_{}", self.resource_type, self.scope_id)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}_{}_{}", self.resource_type, self.scope_id, self.page)
  }
}

/// Result from a read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Storage time of the entry that served a hit
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new result from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_hit(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Cache miss, fetched from the network
  Network,
  /// Unexpired cache entry
  Cache,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub total_entries: usize,
  /// Entries past their TTL that have not been read or purged yet
  pub expired_entries: usize,
}
