//! Upstream mutation capability and its failure taxonomy.

mod http;

use async_trait::async_trait;

use crate::queue::QueuedAction;

pub use http::HttpBackend;

/// Failure delivering a request to the backend.
///
/// The default retry policy retries every variant; the classification is
/// informational.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
  /// Connection failure, timeout, 5xx or rate limiting
  #[error("network error: {0}")]
  Transient(String),
  /// The backend refused the request (4xx)
  #[error("request rejected ({status}): {message}")]
  Rejected { status: u16, message: String },
  /// The backend answered but the body was not what we expected
  #[error("invalid response: {0}")]
  Decode(String),
}

impl SendError {
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient(_))
  }
}

/// Delivers a queued mutation to the backend.
///
/// Delivery is at-least-once: the same action (same `id`) may be sent more
/// than once, so implementations must rely on idempotent handling upstream.
#[async_trait]
pub trait ActionSender: Send + Sync {
  async fn send(&self, action: &QueuedAction) -> Result<(), SendError>;
}
