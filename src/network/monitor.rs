use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ConnectivityProbe, ConnectivityState};
use crate::clock::{Clock, SystemClock};
use crate::queue::{OfflineActionQueue, SyncReport};

/// Quiet period after coming back online before the queue is replayed.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Minimum gap between two foreground-triggered syncs.
pub const DEFAULT_FOREGROUND_COOLDOWN: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct NetworkOptions {
  pub settle_delay: Duration,
  pub foreground_cooldown: Duration,
  /// State assumed until the first report
  pub initially_online: bool,
}

impl Default for NetworkOptions {
  fn default() -> Self {
    Self {
      settle_delay: DEFAULT_SETTLE_DELAY,
      foreground_cooldown: DEFAULT_FOREGROUND_COOLDOWN,
      initially_online: false,
    }
  }
}

/// Connectivity transition, with the number of actions still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
  WentOffline { pending: usize },
  BackOnline { pending: usize },
}

/// Tracks connectivity and replays the offline queue after reconnecting.
///
/// A reconnect triggers at most one sync, and only if the connection is
/// still up once the settle delay has passed. Every sync goes through
/// [`OfflineActionQueue::sync`], which refuses to run twice at once, so
/// manual retries and automatic triggers never race.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<MonitorInner>,
}

struct MonitorInner {
  queue: OfflineActionQueue,
  options: NetworkOptions,
  clock: Arc<dyn Clock>,
  state: watch::Sender<ConnectivityState>,
  /// Bumped on every transition; a settle task only fires if it is unchanged
  generation: AtomicU64,
  last_foreground_sync: Mutex<Option<Instant>>,
  probe: Mutex<Option<JoinHandle<()>>>,
  events: broadcast::Sender<NetworkEvent>,
}

impl NetworkMonitor {
  /// Create a monitor driving `queue` and bind the queue to its state.
  pub fn new(queue: OfflineActionQueue, options: NetworkOptions) -> Self {
    Self::with_clock(queue, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    queue: OfflineActionQueue,
    options: NetworkOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let initial = ConnectivityState::new(options.initially_online, clock.now());
    let (state, rx) = watch::channel(initial);
    queue.bind_connectivity(rx);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Self {
      inner: Arc::new(MonitorInner {
        queue,
        options,
        clock,
        state,
        generation: AtomicU64::new(0),
        last_foreground_sync: Mutex::new(None),
        probe: Mutex::new(None),
        events,
      }),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.inner.state.borrow().online
  }

  /// Watch connectivity changes.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
    self.inner.events.subscribe()
  }

  /// Actions waiting for connectivity.
  pub fn pending(&self) -> usize {
    self.inner.queue.len()
  }

  /// Feed a connectivity sample. Repeated samples of the same state are
  /// ignored.
  pub fn report(&self, online: bool) {
    let now = self.inner.clock.now();
    let changed = self.inner.state.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      *state = ConnectivityState::new(online, now);
      true
    });
    if !changed {
      return;
    }

    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let pending = self.pending();

    if online {
      info!(pending, "Back online");
      self.emit(NetworkEvent::BackOnline { pending });
      self.schedule_sync(generation);
    } else {
      info!(pending, "Went offline");
      self.emit(NetworkEvent::WentOffline { pending });
    }
  }

  /// Sync now, on user request.
  pub async fn retry_now(&self) -> SyncReport {
    info!(pending = self.pending(), "Manual sync requested");
    self.inner.queue.sync().await
  }

  /// The app came back to the foreground: sync if there is work, the
  /// connection is up and the cooldown since the last such sync has passed.
  pub async fn app_foregrounded(&self) -> Option<SyncReport> {
    if self.inner.queue.is_empty() || !self.is_online() {
      return None;
    }

    {
      let mut last = self
        .inner
        .last_foreground_sync
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let now = Instant::now();
      if let Some(previous) = *last {
        if now.duration_since(previous) < self.inner.options.foreground_cooldown {
          debug!("Foreground sync skipped, cooling down");
          return None;
        }
      }
      *last = Some(now);
    }

    Some(self.inner.queue.sync().await)
  }

  /// Poll `probe` every `interval` and report what it sees, until
  /// [`shutdown`](Self::shutdown) or the last monitor handle is dropped.
  ///
  /// Replaces a previously spawned probe.
  pub fn spawn_probe(&self, probe: Arc<dyn ConnectivityProbe>, interval: Duration) {
    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(probe_loop(weak, probe, interval));

    let previous = self
      .inner
      .probe
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Stop the probe loop, if any.
  pub fn shutdown(&self) {
    if let Some(handle) = self
      .inner
      .probe
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      debug!("Stopping connectivity probe");
      handle.abort();
    }
  }

  fn schedule_sync(&self, generation: u64) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!("No async runtime, reconnect sync skipped");
      return;
    };

    let monitor = self.clone();
    runtime.spawn(async move {
      tokio::time::sleep(monitor.inner.options.settle_delay).await;

      if monitor.inner.generation.load(Ordering::SeqCst) != generation {
        debug!("Connectivity changed while settling, reconnect sync dropped");
        return;
      }
      if monitor.inner.queue.is_empty() {
        return;
      }

      let report = monitor.inner.queue.sync().await;
      debug!(outcome = ?report.outcome, committed = report.committed, "Reconnect sync finished");
    });
  }

  fn emit(&self, event: NetworkEvent) {
    let _ = self.inner.events.send(event);
  }
}

async fn probe_loop(monitor: Weak<MonitorInner>, probe: Arc<dyn ConnectivityProbe>, every: Duration) {
  let mut ticker = tokio::time::interval(every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    ticker.tick().await;
    let online = probe.is_online().await;

    let Some(inner) = monitor.upgrade() else {
      break;
    };
    NetworkMonitor { inner }.report(online);
  }
}

impl Drop for MonitorInner {
  fn drop(&mut self) {
    if let Some(handle) = self
      .probe
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
  }
}

impl std::fmt::Debug for NetworkMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NetworkMonitor")
      .field("state", &self.state())
      .field("pending", &self.pending())
      .finish_non_exhaustive()
  }
}
