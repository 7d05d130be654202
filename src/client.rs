//! Resilient client that combines the read cache, retries and the offline queue.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{ActionSender, SendError};
use crate::cache::{CacheKey, CacheResult, ResultCache, DEFAULT_TTL};
use crate::network::NetworkMonitor;
use crate::queue::{NewAction, OfflineActionQueue, QueuedAction};
use crate::retry::{RetryExecutor, RetryPolicy};

/// What happened to a mutation handed to [`ResilientClient::mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The backend confirmed it
  Applied,
  /// Stored in the offline queue, to be replayed later
  Queued(Uuid),
}

/// Read and write entry point for application code.
///
/// Reads are served from the cache while fresh and fetched with retries
/// otherwise. Writes go straight to the backend when that cannot reorder them
/// relative to queued writes, and through the offline queue in every other
/// case. Both write paths invalidate the touched cache scope.
#[derive(Clone)]
pub struct ResilientClient {
  cache: ResultCache,
  queue: OfflineActionQueue,
  monitor: NetworkMonitor,
  sender: Arc<dyn ActionSender>,
  retry: RetryExecutor,
  default_ttl: Duration,
}

impl ResilientClient {
  /// Wire the parts together. `queue` invalidates `cache` on every replayed
  /// action from now on.
  pub fn new(
    cache: ResultCache,
    queue: OfflineActionQueue,
    monitor: NetworkMonitor,
    sender: Arc<dyn ActionSender>,
    retry: RetryPolicy,
  ) -> Self {
    queue.attach_cache(cache.clone());

    Self {
      cache,
      queue,
      monitor,
      sender,
      retry: RetryExecutor::new(retry),
      default_ttl: DEFAULT_TTL,
    }
  }

  /// TTL for reads that do not pass their own.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn cache(&self) -> &ResultCache {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineActionQueue {
    &self.queue
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  /// Read `key` from the cache, or fetch it with retries and cache the result.
  pub async fn read<T, F, Fut>(
    &self,
    key: &CacheKey,
    ttl: Option<Duration>,
    fetch: F,
  ) -> Result<CacheResult<T>, SendError>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
  {
    let key = key.to_string();
    if let Some(entry) = self.cache.get_entry(&key) {
      if let Ok(data) = serde_json::from_value::<T>(entry.value) {
        debug!(key = %key, "Cache hit");
        return Ok(CacheResult::from_cache(data, entry.stored_at));
      }
    }

    debug!(key = %key, "Cache miss, fetching");
    let data = self.retry.run(fetch).await?;
    self
      .cache
      .set(key, &data, ttl.unwrap_or(self.default_ttl));

    Ok(CacheResult::from_network(data))
  }

  /// Drop the cached value for `key` and read it again.
  pub async fn refresh<T, F, Fut>(
    &self,
    key: &CacheKey,
    ttl: Option<Duration>,
    fetch: F,
  ) -> Result<CacheResult<T>, SendError>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
  {
    self.cache.remove(&key.to_string());
    self.read(key, ttl, fetch).await
  }

  /// Apply a mutation, or queue it when that is not possible right now.
  ///
  /// It is sent directly only while online with an empty queue; otherwise it
  /// would overtake the queued actions. A direct send that exhausts its
  /// retries is returned as an error and nothing is queued.
  pub async fn mutate(&self, action: NewAction) -> Result<MutationOutcome> {
    let scope = action.target_resource.clone();

    let outcome = if self.monitor.is_online() && self.queue.is_empty() {
      let action = QueuedAction::from_new(action, Utc::now());
      let sender = Arc::clone(&self.sender);

      self
        .retry
        .run(|| {
          let sender = Arc::clone(&sender);
          let action = action.clone();
          async move { sender.send(&action).await }
        })
        .await
        .map_err(|e| eyre!("Failed to apply {} on {}: {}", action.kind, scope, e))?;

      debug!(action_id = %action.id, target = %scope, "Mutation applied");
      MutationOutcome::Applied
    } else {
      let queued = self.queue.enqueue(action)?;
      info!(
        action_id = %queued.id,
        pending = self.queue.len(),
        "Offline, mutation queued for sync"
      );
      MutationOutcome::Queued(queued.id)
    };

    let dropped = self.cache.invalidate(&scope);
    debug!(target = %scope, dropped, "Invalidated cache scope");

    Ok(outcome)
  }
}

impl std::fmt::Debug for ResilientClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResilientClient")
      .field("cache", &self.cache)
      .field("queue", &self.queue)
      .field("monitor", &self.monitor)
      .field("default_ttl", &self.default_ttl)
      .finish_non_exhaustive()
  }
}
