//! Connectivity tracking and the reconnect trigger for the offline queue.

mod monitor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use monitor::{
  NetworkEvent, NetworkMonitor, NetworkOptions, DEFAULT_FOREGROUND_COOLDOWN, DEFAULT_SETTLE_DELAY,
};

/// Last known connectivity, owned by [`NetworkMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub online: bool,
  pub last_transition_at: DateTime<Utc>,
}

impl ConnectivityState {
  pub fn new(online: bool, last_transition_at: DateTime<Utc>) -> Self {
    Self {
      online,
      last_transition_at,
    }
  }
}

/// Source of connectivity samples for [`NetworkMonitor::spawn_probe`].
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
  async fn is_online(&self) -> bool;
}
