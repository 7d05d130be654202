//! Durable, strictly ordered queue of mutations made while offline.
//!
//! - Every action is persisted before `enqueue` returns
//! - `sync` replays the whole queue in FIFO order, one action at a time
//! - A failing action halts the replay; nothing behind it is attempted
//! - Actions are erased only after the backend confirms them

mod action;
mod offline;
mod status;

pub use action::{ActionKind, NewAction, QueuedAction};
pub use offline::{OfflineActionQueue, QueueOptions, DEFAULT_DISPATCH_SPACING, QUEUE_NAMESPACE};
pub use status::{QueueEvent, SyncOutcome, SyncReport};
