use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::action::{NewAction, QueuedAction};
use super::status::{QueueEvent, SyncOutcome, SyncReport};
use crate::backend::{ActionSender, SendError};
use crate::cache::ResultCache;
use crate::clock::{Clock, SystemClock};
use crate::network::ConnectivityState;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::storage::DurableKv;

/// Storage key holding the serialized queue.
pub const QUEUE_NAMESPACE: &str = "offline_queue";

/// Pause between two dispatched actions.
pub const DEFAULT_DISPATCH_SPACING: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct QueueOptions {
  /// Policy applied to each action during replay
  pub retry: RetryPolicy,
  pub dispatch_spacing: Duration,
  /// Storage key for the queue; the corrupt-data backup goes to `{namespace}.corrupt`
  pub namespace: String,
}

impl Default for QueueOptions {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      dispatch_spacing: DEFAULT_DISPATCH_SPACING,
      namespace: QUEUE_NAMESPACE.to_string(),
    }
  }
}

/// Durable FIFO of pending mutations with head-of-line blocking replay.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OfflineActionQueue {
  inner: Arc<QueueInner>,
}

struct QueueInner {
  store: Arc<dyn DurableKv>,
  sender: Arc<dyn ActionSender>,
  clock: Arc<dyn Clock>,
  options: QueueOptions,
  /// In-memory mirror of the persisted list, in enqueue order
  actions: Mutex<Vec<QueuedAction>>,
  in_flight: Mutex<Option<Uuid>>,
  /// Held for the whole of a sync run
  sync_guard: tokio::sync::Mutex<()>,
  events: broadcast::Sender<QueueEvent>,
  connectivity: OnceLock<watch::Receiver<ConnectivityState>>,
  cache: OnceLock<ResultCache>,
  load_warning: Option<String>,
}

impl OfflineActionQueue {
  /// Load the queue from `store`, resuming whatever was pending.
  ///
  /// Unreadable or malformed data is logged, preserved under a backup key and
  /// replaced by an empty queue; see [`load_warning`](Self::load_warning).
  pub fn open(
    store: Arc<dyn DurableKv>,
    sender: Arc<dyn ActionSender>,
    options: QueueOptions,
  ) -> Self {
    Self::open_with_clock(store, sender, options, Arc::new(SystemClock))
  }

  pub fn open_with_clock(
    store: Arc<dyn DurableKv>,
    sender: Arc<dyn ActionSender>,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (actions, load_warning) = load(store.as_ref(), &options.namespace);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Self {
      inner: Arc::new(QueueInner {
        store,
        sender,
        clock,
        options,
        actions: Mutex::new(actions),
        in_flight: Mutex::new(None),
        sync_guard: tokio::sync::Mutex::new(()),
        events,
        connectivity: OnceLock::new(),
        cache: OnceLock::new(),
        load_warning,
      }),
    }
  }

  /// Follow a connectivity feed: `sync` is skipped while it reports offline,
  /// and `enqueue` dispatches right away while it reports online.
  ///
  /// Only the first binding takes effect.
  pub fn bind_connectivity(&self, state: watch::Receiver<ConnectivityState>) {
    if self.inner.connectivity.set(state).is_err() {
      warn!("Offline queue is already bound to a connectivity feed");
    }
  }

  /// Invalidate the target scope of every committed action in `cache`.
  pub fn attach_cache(&self, cache: ResultCache) {
    if self.inner.cache.set(cache).is_err() {
      warn!("Offline queue already has a cache attached");
    }
  }

  /// Receive queue events. Slow receivers may miss events (lagged).
  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  /// Problem found while loading persisted data, if any.
  pub fn load_warning(&self) -> Option<&str> {
    self.inner.load_warning.as_deref()
  }

  /// Number of actions not yet committed.
  pub fn len(&self) -> usize {
    self.actions().len()
  }

  pub fn is_empty(&self) -> bool {
    self.actions().is_empty()
  }

  /// Pending actions in replay order.
  pub fn snapshot(&self) -> Vec<QueuedAction> {
    self.actions().clone()
  }

  /// Id of the action currently being delivered.
  pub fn in_flight(&self) -> Option<Uuid> {
    *self
      .inner
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Append an action. It is durable once this returns `Ok`.
  ///
  /// If this makes the queue non-empty while connectivity is known to be up,
  /// a sync is started in the background.
  pub fn enqueue(&self, action: NewAction) -> Result<QueuedAction> {
    let queued = QueuedAction::from_new(action, self.inner.clock.now());

    let pending = {
      let mut actions = self.actions();
      actions.push(queued.clone());
      if let Err(e) = self.persist(&actions) {
        actions.pop();
        return Err(e.wrap_err("Failed to persist queued action"));
      }
      actions.len()
    };

    info!(
      action_id = %queued.id,
      kind = %queued.kind,
      target = %queued.target_resource,
      pending,
      "Queued action"
    );
    self.emit(QueueEvent::Enqueued {
      id: queued.id,
      pending,
    });

    if pending == 1 && self.connectivity() == Some(true) {
      self.spawn_sync();
    }

    Ok(queued)
  }

  /// Replay pending actions in order until the queue is empty or an action
  /// exhausts its retries.
  ///
  /// Never fails: the outcome is reported in the returned [`SyncReport`] and
  /// through [`QueueEvent`]s. At most one run is active at a time; a
  /// concurrent call returns [`SyncOutcome::AlreadyRunning`] immediately.
  pub async fn sync(&self) -> SyncReport {
    let Ok(_guard) = self.inner.sync_guard.try_lock() else {
      return SyncReport::skipped(SyncOutcome::AlreadyRunning, self.len());
    };

    let mut total = self.len();
    if total == 0 {
      return SyncReport::skipped(SyncOutcome::Idle, 0);
    }
    if self.connectivity() == Some(false) {
      return SyncReport::skipped(SyncOutcome::Offline, total);
    }

    info!(pending = total, "Syncing offline queue");
    let executor = RetryExecutor::new(self.inner.options.retry);
    let mut committed = 0;

    loop {
      let Some(head) = self.head() else {
        break;
      };
      // Actions enqueued while the run is going are drained too
      total = total.max(committed + self.len());

      if self.connectivity() == Some(false) {
        info!(committed, remaining = self.len(), "Connectivity lost, sync stopped");
        return SyncReport {
          outcome: SyncOutcome::Offline,
          total,
          committed,
          remaining: self.len(),
        };
      }

      let in_flight = InFlight::mark(&self.inner.in_flight, head.id);
      let sender = Arc::clone(&self.inner.sender);
      let result = executor
        .run_notify(
          || {
            let sender = Arc::clone(&sender);
            let action = head.clone();
            async move { sender.send(&action).await }
          },
          |_, err: &SendError| self.record_failure(head.id, err),
        )
        .await;
      drop(in_flight);

      match result {
        Ok(()) => {
          let pending = self.commit(head.id);
          committed += 1;

          if let Some(cache) = self.inner.cache.get() {
            cache.invalidate(&head.target_resource);
          }
          self.emit(QueueEvent::Committed {
            id: head.id,
            pending,
          });

          let spacing = self.inner.options.dispatch_spacing;
          if pending > 0 && !spacing.is_zero() {
            tokio::time::sleep(spacing).await;
          }
        }
        Err(err) => {
          let remaining = self.len();
          warn!(
            action_id = %head.id,
            remaining,
            "Sync paused, action could not be delivered: {}",
            err
          );
          self.emit(QueueEvent::SyncPaused {
            id: head.id,
            error: err.to_string(),
            pending: remaining,
          });
          return SyncReport {
            outcome: SyncOutcome::Paused {
              action_id: head.id,
              error: err.to_string(),
            },
            total,
            committed,
            remaining,
          };
        }
      }
    }

    info!(committed, "Offline queue synced");
    self.emit(QueueEvent::SyncCompleted { committed });
    SyncReport {
      outcome: SyncOutcome::Completed,
      total,
      committed,
      remaining: self.len(),
    }
  }

  /// Drop a pending action without sending it. Returns whether it existed.
  pub fn discard(&self, id: Uuid) -> Result<bool> {
    let pending = {
      let mut actions = self.actions();
      let Some(index) = actions.iter().position(|a| a.id == id) else {
        return Ok(false);
      };
      let removed = actions.remove(index);
      if let Err(e) = self.persist(&actions) {
        actions.insert(index, removed);
        return Err(e.wrap_err("Failed to persist discarded action"));
      }
      actions.len()
    };

    info!(action_id = %id, pending, "Discarded queued action");
    self.emit(QueueEvent::Discarded { id, pending });
    Ok(true)
  }

  /// Drop every pending action.
  pub fn clear(&self) -> Result<()> {
    let mut actions = self.actions();
    self
      .inner
      .store
      .remove(&self.inner.options.namespace)
      .map_err(|e| e.wrap_err("Failed to clear offline queue"))?;
    let dropped = actions.len();
    actions.clear();
    drop(actions);

    info!(dropped, "Cleared offline queue");
    self.emit(QueueEvent::Cleared);
    Ok(())
  }

  fn actions(&self) -> MutexGuard<'_, Vec<QueuedAction>> {
    self
      .inner
      .actions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn head(&self) -> Option<QueuedAction> {
    self.actions().first().cloned()
  }

  fn connectivity(&self) -> Option<bool> {
    self
      .inner
      .connectivity
      .get()
      .map(|state| state.borrow().online)
  }

  fn persist(&self, actions: &[QueuedAction]) -> Result<()> {
    let raw = serde_json::to_string(actions)
      .map_err(|e| eyre!("Failed to serialize offline queue: {}", e))?;
    self.inner.store.set(&self.inner.options.namespace, &raw)
  }

  /// Erase a confirmed action. Returns the number still pending.
  fn commit(&self, id: Uuid) -> usize {
    let mut actions = self.actions();
    actions.retain(|a| a.id != id);
    if let Err(e) = self.persist(&actions) {
      // The stored copy will be replayed after a restart
      error!(action_id = %id, "Failed to erase committed action: {:#}", e);
    }
    actions.len()
  }

  fn record_failure(&self, id: Uuid, err: &SendError) {
    let attempts = {
      let mut actions = self.actions();
      let Some(action) = actions.iter_mut().find(|a| a.id == id) else {
        return;
      };
      action.attempts += 1;
      action.last_error = Some(err.to_string());
      let attempts = action.attempts;

      if let Err(e) = self.persist(&actions) {
        error!(action_id = %id, "Failed to persist attempt count: {:#}", e);
      }
      attempts
    };

    self.emit(QueueEvent::AttemptFailed {
      id,
      attempts,
      error: err.to_string(),
    });
  }

  fn spawn_sync(&self) {
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let queue = self.clone();
        handle.spawn(async move {
          queue.sync().await;
        });
      }
      Err(_) => warn!("No async runtime, queued action will wait for the next sync"),
    }
  }

  fn emit(&self, event: QueueEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }
}

impl std::fmt::Debug for OfflineActionQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineActionQueue")
      .field("pending", &self.len())
      .field("in_flight", &self.in_flight())
      .field("options", &self.inner.options)
      .finish_non_exhaustive()
  }
}

/// Marks an action as being delivered until dropped, so a cancelled
/// `sync` future does not leave a stale id behind.
struct InFlight<'a> {
  slot: &'a Mutex<Option<Uuid>>,
}

impl<'a> InFlight<'a> {
  fn mark(slot: &'a Mutex<Option<Uuid>>, id: Uuid) -> Self {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    Self { slot }
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }
}

fn load(store: &dyn DurableKv, namespace: &str) -> (Vec<QueuedAction>, Option<String>) {
  let raw = match store.get(namespace) {
    Ok(Some(raw)) => raw,
    Ok(None) => return (Vec::new(), None),
    Err(e) => {
      error!("Offline queue storage unreadable, starting empty: {:#}", e);
      return (Vec::new(), Some(format!("queue storage unreadable: {}", e)));
    }
  };

  match serde_json::from_str::<Vec<QueuedAction>>(&raw) {
    Ok(actions) => {
      if !actions.is_empty() {
        info!(pending = actions.len(), "Resuming offline queue");
      }
      (actions, None)
    }
    Err(e) => {
      let backup = format!("{}.corrupt", namespace);
      error!(
        backup = %backup,
        "Offline queue data is corrupt, starting empty: {}",
        e
      );
      if let Err(e) = store.set(&backup, &raw) {
        error!("Failed to back up corrupt queue data: {:#}", e);
      }
      (
        Vec::new(),
        Some(format!("queue data corrupt ({}); preserved under {}", e, backup)),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::ActionKind;
  use crate::storage::MemoryKv;
  use async_trait::async_trait;
  use chrono::Utc;
  use serde_json::json;
  use std::collections::HashSet;

  /// Sender that records every attempt and fails for actions whose payload
  /// carries `"fail": true` or while `offline` is set.
  #[derive(Default)]
  struct RecordingSender {
    attempts: Mutex<Vec<String>>,
    offline: std::sync::atomic::AtomicBool,
    delay: Option<Duration>,
  }

  impl RecordingSender {
    fn attempts(&self) -> Vec<String> {
      self.attempts.lock().unwrap().clone()
    }

    fn distinct(&self) -> Vec<String> {
      let mut seen = HashSet::new();
      self
        .attempts()
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
    }
  }

  #[async_trait]
  impl ActionSender for RecordingSender {
    async fn send(&self, action: &QueuedAction) -> Result<(), SendError> {
      let name = action.payload["name"].as_str().unwrap_or("?").to_string();
      self.attempts.lock().unwrap().push(name);

      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(SendError::Transient("connection refused".into()));
      }
      if action.payload["fail"] == json!(true) {
        return Err(SendError::Rejected {
          status: 422,
          message: "invalid book".into(),
        });
      }
      Ok(())
    }
  }

  /// Store whose writes can be made to fail.
  #[derive(Default)]
  struct FlakyKv {
    inner: MemoryKv,
    fail_writes: std::sync::atomic::AtomicBool,
  }

  impl DurableKv for FlakyKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
      if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key)
    }
  }

  fn options() -> QueueOptions {
    QueueOptions {
      retry: RetryPolicy::new(3, Duration::from_millis(300)),
      dispatch_spacing: Duration::ZERO,
      ..QueueOptions::default()
    }
  }

  fn book(name: &str) -> NewAction {
    NewAction::create("books_user1", json!({ "name": name }))
  }

  fn failing_book(name: &str) -> NewAction {
    NewAction::create("books_user1", json!({ "name": name, "fail": true }))
  }

  fn queue_with(store: Arc<dyn DurableKv>, sender: Arc<RecordingSender>) -> OfflineActionQueue {
    OfflineActionQueue::open(store, sender, options())
  }

  fn names(queue: &OfflineActionQueue) -> Vec<String> {
    queue
      .snapshot()
      .iter()
      .map(|a| a.payload["name"].as_str().unwrap().to_string())
      .collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_sends_in_enqueue_order() {
    let sender = Arc::new(RecordingSender::default());
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());

    for name in ["a", "b", "c", "d", "e"] {
      queue.enqueue(book(name)).unwrap();
    }
    assert_eq!(queue.len(), 5);

    let report = queue.sync().await;

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.total, 5);
    assert_eq!(report.committed, 5);
    assert_eq!(report.remaining, 0);
    assert_eq!(sender.attempts(), vec!["a", "b", "c", "d", "e"]);
    assert!(queue.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_action_blocks_the_rest() {
    let sender = Arc::new(RecordingSender::default());
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());

    queue.enqueue(book("A")).unwrap();
    let b = queue.enqueue(failing_book("B")).unwrap();
    queue.enqueue(book("C")).unwrap();

    let report = queue.sync().await;

    assert_eq!(
      report.outcome,
      SyncOutcome::Paused {
        action_id: b.id,
        error: "request rejected (422): invalid book".into()
      }
    );
    assert_eq!(report.committed, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(names(&queue), vec!["B", "C"]);
    // B ran 1 + 3 retries, C never ran
    assert_eq!(sender.attempts(), vec!["A", "B", "B", "B", "B"]);

    let stuck = &queue.snapshot()[0];
    assert_eq!(stuck.attempts, 4);
    assert_eq!(
      stuck.last_error.as_deref(),
      Some("request rejected (422): invalid book")
    );
    assert_eq!(queue.snapshot()[1].attempts, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_paused_queue_resumes_after_fix() {
    let sender = Arc::new(RecordingSender::default());
    sender.offline.store(true, std::sync::atomic::Ordering::SeqCst);
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());

    queue.enqueue(book("1")).unwrap();
    queue.enqueue(book("2")).unwrap();

    let report = queue.sync().await;
    assert!(matches!(report.outcome, SyncOutcome::Paused { .. }));
    assert_eq!(queue.len(), 2);

    sender.offline.store(false, std::sync::atomic::Ordering::SeqCst);
    let report = queue.sync().await;

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(sender.distinct(), vec!["1", "2"]);
    assert!(queue.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_queue_size_tracks_lifecycle() {
    let sender = Arc::new(RecordingSender::default());
    let queue = queue_with(Arc::new(MemoryKv::new()), sender);
    let mut events = queue.subscribe();

    queue.enqueue(book("a")).unwrap();
    queue.enqueue(failing_book("b")).unwrap();
    queue.sync().await;

    let mut pending_seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      match event {
        QueueEvent::Enqueued { pending, .. } | QueueEvent::Committed { pending, .. } => {
          pending_seen.push(pending)
        }
        QueueEvent::SyncPaused { pending, .. } => pending_seen.push(pending),
        _ => {}
      }
    }

    assert_eq!(pending_seen, vec![1, 2, 1, 1]);
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_state_survives_restart() {
    let store: Arc<dyn DurableKv> = Arc::new(MemoryKv::new());
    let sender = Arc::new(RecordingSender::default());

    {
      let queue = queue_with(store.clone(), sender.clone());
      queue.enqueue(book("first")).unwrap();
      queue.enqueue(failing_book("second")).unwrap();
      queue.enqueue(book("third")).unwrap();
      queue.sync().await;
    }

    let reopened = queue_with(store, sender);
    assert!(reopened.load_warning().is_none());
    assert_eq!(names(&reopened), vec!["second", "third"]);

    let head = &reopened.snapshot()[0];
    assert_eq!(head.attempts, 4);
    assert!(head.last_error.is_some());
  }

  #[tokio::test]
  async fn test_corrupt_storage_starts_empty_and_keeps_backup() {
    let store = Arc::new(MemoryKv::new());
    store.set(QUEUE_NAMESPACE, "{not json").unwrap();

    let queue = queue_with(store.clone(), Arc::new(RecordingSender::default()));

    assert!(queue.is_empty());
    assert!(queue.load_warning().unwrap().contains("corrupt"));
    assert_eq!(
      store.get("offline_queue.corrupt").unwrap().as_deref(),
      Some("{not json")
    );

    // The queue is usable again
    queue.enqueue(book("x")).unwrap();
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test]
  async fn test_enqueue_fails_when_not_durable() {
    let store = Arc::new(FlakyKv::default());
    let queue = queue_with(store.clone(), Arc::new(RecordingSender::default()));

    queue.enqueue(book("ok")).unwrap();
    store
      .fail_writes
      .store(true, std::sync::atomic::Ordering::SeqCst);

    assert!(queue.enqueue(book("lost")).is_err());
    assert_eq!(names(&queue), vec!["ok"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_only_one_sync_runs_at_a_time() {
    let sender = Arc::new(RecordingSender {
      delay: Some(Duration::from_millis(50)),
      ..RecordingSender::default()
    });
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());
    queue.enqueue(book("a")).unwrap();
    queue.enqueue(book("b")).unwrap();

    let (first, second) = tokio::join!(queue.sync(), queue.sync());

    assert_eq!(first.outcome, SyncOutcome::Completed);
    assert_eq!(second.outcome, SyncOutcome::AlreadyRunning);
    assert_eq!(sender.attempts(), vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_sync_skipped_while_offline() {
    let sender = Arc::new(RecordingSender::default());
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());
    let (_tx, rx) = watch::channel(ConnectivityState::new(false, Utc::now()));
    queue.bind_connectivity(rx);

    queue.enqueue(book("a")).unwrap();
    let report = queue.sync().await;

    assert_eq!(report.outcome, SyncOutcome::Offline);
    assert_eq!(report.remaining, 1);
    assert!(sender.attempts().is_empty());
  }

  #[tokio::test]
  async fn test_empty_queue_is_idle() {
    let queue = queue_with(
      Arc::new(MemoryKv::new()),
      Arc::new(RecordingSender::default()),
    );
    let report = queue.sync().await;
    assert_eq!(report.outcome, SyncOutcome::Idle);
    assert!(report.is_complete());
  }

  #[tokio::test(start_paused = true)]
  async fn test_enqueue_while_online_dispatches() {
    let sender = Arc::new(RecordingSender::default());
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());
    let (_tx, rx) = watch::channel(ConnectivityState::new(true, Utc::now()));
    queue.bind_connectivity(rx);

    queue.enqueue(book("now")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(sender.attempts(), vec!["now"]);
    assert!(queue.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_commit_invalidates_target_scope() {
    let cache = ResultCache::new();
    cache.set("books_user1_0", &vec!["stale"], Duration::from_secs(60));
    cache.set("books_user2_0", &vec!["other"], Duration::from_secs(60));

    let queue = queue_with(
      Arc::new(MemoryKv::new()),
      Arc::new(RecordingSender::default()),
    );
    queue.attach_cache(cache.clone());
    queue.enqueue(book("new")).unwrap();
    queue.sync().await;

    assert!(!cache.has("books_user1_0"));
    assert!(cache.has("books_user2_0"));
  }

  #[tokio::test]
  async fn test_discard_and_clear() {
    let store = Arc::new(MemoryKv::new());
    let queue = queue_with(store.clone(), Arc::new(RecordingSender::default()));

    let a = queue.enqueue(book("a")).unwrap();
    queue.enqueue(NewAction::new(
      ActionKind::Custom("mark_finished".into()),
      "books_user1",
      json!({ "name": "b" }),
    ))
    .unwrap();

    assert!(queue.discard(a.id).unwrap());
    assert!(!queue.discard(a.id).unwrap());
    assert_eq!(names(&queue), vec!["b"]);

    queue.clear().unwrap();
    assert!(queue.is_empty());
    assert_eq!(store.get(QUEUE_NAMESPACE).unwrap(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_sync_clears_in_flight() {
    let sender = Arc::new(RecordingSender {
      delay: Some(Duration::from_secs(10)),
      ..RecordingSender::default()
    });
    let queue = queue_with(Arc::new(MemoryKv::new()), sender);
    let action = queue.enqueue(book("slow")).unwrap();

    let mut sync = Box::pin(queue.sync());
    assert!(tokio::time::timeout(Duration::from_secs(1), &mut sync)
      .await
      .is_err());
    assert_eq!(queue.in_flight(), Some(action.id));

    drop(sync);
    assert_eq!(queue.in_flight(), None);
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_after_interrupted_sync_resumes_from_head() {
    let store: Arc<dyn DurableKv> = Arc::new(MemoryKv::new());
    let slow = Arc::new(RecordingSender {
      delay: Some(Duration::from_secs(10)),
      ..RecordingSender::default()
    });
    slow.offline.store(true, std::sync::atomic::Ordering::SeqCst);

    let queue = queue_with(store.clone(), slow.clone());
    queue.enqueue(book("first")).unwrap();
    queue.enqueue(book("second")).unwrap();

    // A failed run leaves attempts on the head
    let report = queue.sync().await;
    assert!(matches!(report.outcome, SyncOutcome::Paused { .. }));

    // The next run dies while the head is on the wire
    slow.offline.store(false, std::sync::atomic::Ordering::SeqCst);
    let mut sync = Box::pin(queue.sync());
    assert!(tokio::time::timeout(Duration::from_secs(1), &mut sync)
      .await
      .is_err());
    drop(sync);
    drop(queue);

    let sender = Arc::new(RecordingSender::default());
    let reopened = queue_with(store, sender.clone());
    assert_eq!(names(&reopened), vec!["first", "second"]);
    assert_eq!(reopened.snapshot()[0].attempts, 4);

    let report = reopened.sync().await;
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(sender.attempts(), vec!["first", "second"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_report_counts_actions_enqueued_during_sync() {
    let sender = Arc::new(RecordingSender {
      delay: Some(Duration::from_millis(50)),
      ..RecordingSender::default()
    });
    let queue = queue_with(Arc::new(MemoryKv::new()), sender.clone());
    queue.enqueue(book("a")).unwrap();
    queue.enqueue(book("b")).unwrap();

    let running = queue.clone();
    let handle = tokio::spawn(async move { running.sync().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.enqueue(book("late")).unwrap();

    let report = handle.await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.committed, 3);
    assert_eq!(report.total, 3);
    assert_eq!(sender.attempts(), vec!["a", "b", "late"]);
  }
}
