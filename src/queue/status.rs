//! Status signals published by the queue.

use uuid::Uuid;

/// Notification for observers of the queue (pending-count badges, toasts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued { id: Uuid, pending: usize },
  /// The backend confirmed the action and it was erased
  Committed { id: Uuid, pending: usize },
  AttemptFailed { id: Uuid, attempts: u32, error: String },
  /// Every pending action was delivered
  SyncCompleted { committed: usize },
  /// Replay stopped at `id`; it and everything behind it stay queued
  SyncPaused { id: Uuid, error: String, pending: usize },
  Discarded { id: Uuid, pending: usize },
  Cleared,
}

/// How a `sync` run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// The queue was drained
  Completed,
  /// An action exhausted its retries
  Paused { action_id: Uuid, error: String },
  /// Another sync run holds the queue
  AlreadyRunning,
  /// Connectivity is known to be down
  Offline,
  /// Nothing to send
  Idle,
}

/// Progress of one `sync` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub outcome: SyncOutcome,
  /// Actions the run dealt with: pending at the start plus any enqueued
  /// while it was draining. Never less than `committed`.
  pub total: usize,
  pub committed: usize,
  /// Actions still queued when the run ended
  pub remaining: usize,
}

impl SyncReport {
  pub(crate) fn skipped(outcome: SyncOutcome, pending: usize) -> Self {
    Self {
      outcome,
      total: pending,
      committed: 0,
      remaining: pending,
    }
  }

  pub fn is_complete(&self) -> bool {
    matches!(self.outcome, SyncOutcome::Completed | SyncOutcome::Idle)
  }
}
