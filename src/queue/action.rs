//! Queued mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What a queued mutation does to its target resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
  Create,
  Update,
  Delete,
  /// Application-defined operation, e.g. `mark_finished`
  Custom(String),
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Create => write!(f, "create"),
      Self::Update => write!(f, "update"),
      Self::Delete => write!(f, "delete"),
      Self::Custom(name) => write!(f, "custom:{}", name),
    }
  }
}

impl FromStr for ActionKind {
  type Err = String;

  /// Parses `create`, `update`, `delete` or `custom:<name>`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => match other.strip_prefix("custom:") {
        Some(name) if !name.is_empty() => Ok(Self::Custom(name.to_string())),
        _ => Err(format!(
          "unknown action kind '{}' (expected create, update, delete or custom:<name>)",
          s
        )),
      },
    }
  }
}

/// A mutation waiting to be delivered to the backend.
///
/// Stays queued until the backend confirms it; `attempts` and `last_error`
/// record failed replays and survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  /// Client-generated id, usable by the backend for deduplication
  pub id: Uuid,
  pub kind: ActionKind,
  /// Resource scope touched, e.g. `books_user1`
  pub target_resource: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueuedAction {
  pub(crate) fn from_new(action: NewAction, created_at: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      kind: action.kind,
      target_resource: action.target_resource,
      payload: action.payload,
      created_at,
      attempts: 0,
      last_error: None,
    }
  }
}

/// Caller-supplied description of a mutation, before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
  pub kind: ActionKind,
  pub target_resource: String,
  pub payload: Value,
}

impl NewAction {
  pub fn new(kind: ActionKind, target_resource: impl Into<String>, payload: Value) -> Self {
    Self {
      kind,
      target_resource: target_resource.into(),
      payload,
    }
  }

  pub fn create(target_resource: impl Into<String>, payload: Value) -> Self {
    Self::new(ActionKind::Create, target_resource, payload)
  }

  pub fn update(target_resource: impl Into<String>, payload: Value) -> Self {
    Self::new(ActionKind::Update, target_resource, payload)
  }

  pub fn delete(target_resource: impl Into<String>, payload: Value) -> Self {
    Self::new(ActionKind::Delete, target_resource, payload)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_kinds() {
    assert_eq!("create".parse::<ActionKind>(), Ok(ActionKind::Create));
    assert_eq!(" Update ".parse::<ActionKind>(), Ok(ActionKind::Update));
    assert_eq!("delete".parse::<ActionKind>(), Ok(ActionKind::Delete));
    assert_eq!(
      "custom:mark_finished".parse::<ActionKind>(),
      Ok(ActionKind::Custom("mark_finished".to_string()))
    );
    assert!("custom:".parse::<ActionKind>().is_err());
    assert!("upsert".parse::<ActionKind>().is_err());
  }

  #[test]
  fn test_persisted_shape() {
    let action = QueuedAction::from_new(
      NewAction::create("books_user1", json!({"title": "Dune"})),
      Utc::now(),
    );
    let value = serde_json::to_value(&action).unwrap();

    assert_eq!(value["kind"], "create");
    assert_eq!(value["target_resource"], "books_user1");
    assert_eq!(value["attempts"], 0);
    assert!(value.get("last_error").is_none());
  }

  #[test]
  fn test_records_without_attempts_still_load() {
    let raw = r#"{
      "id": "7f1c8a52-0b5e-4f0c-9d2a-3e1f5b6c7d8e",
      "kind": {"custom": "log_progress"},
      "target_resource": "progress_user1",
      "payload": {"page": 12},
      "created_at": "2024-03-01T10:00:00Z"
    }"#;

    let action: QueuedAction = serde_json::from_str(raw).unwrap();
    assert_eq!(action.kind, ActionKind::Custom("log_progress".to_string()));
    assert_eq!(action.attempts, 0);
    assert_eq!(action.last_error, None);
  }
}
