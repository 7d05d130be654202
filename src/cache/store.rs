//! In-memory result cache with per-entry TTL and FIFO capacity bound.

use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::types::{CacheEntry, CacheStats};
use crate::clock::{Clock, SystemClock};

/// TTL used when callers have no better idea.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on any entry's TTL.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// How often [`ResultCache::spawn_cleanup`] purges by default.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Key-value store of recently fetched read results.
///
/// Values are stored as JSON so one cache can hold results of different types.
/// No operation ever fails: a missing, expired or undecodable entry reads as
/// `None`, and a value that cannot be serialized is simply not stored.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct ResultCache {
  inner: Arc<CacheInner>,
}

struct CacheInner {
  /// Insertion order doubles as FIFO eviction order
  entries: Mutex<IndexMap<String, CacheEntry>>,
  clock: Arc<dyn Clock>,
  max_entries: usize,
}

impl ResultCache {
  /// Create a cache on the system clock with the default capacity.
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self::build(clock, DEFAULT_MAX_ENTRIES)
  }

  /// Set the entry cap. Values below one are raised to one.
  pub fn with_max_entries(self, max_entries: usize) -> Self {
    Self::build(Arc::clone(&self.inner.clock), max_entries)
  }

  fn build(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        entries: Mutex::new(IndexMap::new()),
        clock,
        max_entries: max_entries.max(1),
      }),
    }
  }

  fn entries(&self) -> MutexGuard<'_, IndexMap<String, CacheEntry>> {
    self
      .inner
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up a value. Expired entries are evicted and read as a miss.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).and_then(|entry| {
      serde_json::from_value(entry.value)
        .map_err(|e| warn!(key, "Cached value has unexpected shape: {}", e))
        .ok()
    })
  }

  /// Look up the raw entry, with its storage metadata.
  pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    let now = self.inner.clock.now();
    let mut entries = self.entries();

    match entries.get(key) {
      Some(entry) if entry.is_valid_at(now) => Some(entry.clone()),
      Some(_) => {
        entries.shift_remove(key);
        debug!(key, "Cache entry expired");
        None
      }
      None => None,
    }
  }

  /// Store a value, replacing any previous one and restarting its TTL.
  ///
  /// The TTL is clamped to [`MAX_TTL`].
  pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
    let key = key.into();
    let value = match serde_json::to_value(value) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = %key, "Failed to serialize value for cache: {}", e);
        return;
      }
    };

    let entry = CacheEntry {
      key: key.clone(),
      value,
      stored_at: self.inner.clock.now(),
      ttl: ttl.min(MAX_TTL),
    };

    let mut entries = self.entries();
    // Re-inserting moves the key to the back of the FIFO order
    entries.shift_remove(&key);
    entries.insert(key, entry);

    while entries.len() > self.inner.max_entries {
      if let Some((evicted, _)) = entries.shift_remove_index(0) {
        debug!(key = %evicted, "Cache full, evicted oldest entry");
      }
    }
  }

  /// Whether an unexpired entry exists for `key`.
  pub fn has(&self, key: &str) -> bool {
    self.get_entry(key).is_some()
  }

  /// Remove every entry whose key equals or starts with `prefix`.
  ///
  /// Returns the number of entries removed.
  pub fn invalidate(&self, prefix: &str) -> usize {
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    let removed = before - entries.len();

    if removed > 0 {
      debug!(prefix, removed, "Invalidated cache entries");
    }
    removed
  }

  /// Remove a single key. Returns whether it was present.
  pub fn remove(&self, key: &str) -> bool {
    self.entries().shift_remove(key).is_some()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  /// Drop all expired entries. Returns how many were removed.
  pub fn purge_expired(&self) -> usize {
    let now = self.inner.clock.now();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_valid_at(now));
    let removed = before - entries.len();

    if removed > 0 {
      debug!(removed, "Purged expired cache entries");
    }
    removed
  }

  /// Purge expired entries now and then every `interval`, until the task is
  /// aborted or the last handle to the cache is dropped.
  pub fn spawn_cleanup(&self, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        ResultCache { inner }.purge_expired();
      }
    })
  }

  pub fn stats(&self) -> CacheStats {
    let now = self.inner.clock.now();
    let entries = self.entries();

    CacheStats {
      total_entries: entries.len(),
      expired_entries: entries.values().filter(|e| !e.is_valid_at(now)).count(),
    }
  }

  /// Number of stored entries, including expired ones not yet evicted.
  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }
}

impl Default for ResultCache {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ResultCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResultCache")
      .field("entries", &self.len())
      .field("max_entries", &self.inner.max_entries)
      .finish_non_exhaustive()
  }
}
