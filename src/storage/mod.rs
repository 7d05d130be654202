//! Durable key-value storage used to persist the offline queue.
//!
//! Each target platform supplies its own backing store by implementing
//! [`DurableKv`]. A `set` must be atomic and durable once it returns.

mod sqlite;

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub use sqlite::SqliteKv;

/// Pluggable durable key-value store.
pub trait DurableKv: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Atomically replace the value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store. Nothing survives a restart; used for tests and when
/// persistence is disabled.
#[derive(Debug, Default)]
pub struct MemoryKv {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableKv for MemoryKv {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    values.remove(key);
    Ok(())
  }
}
