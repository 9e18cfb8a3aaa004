//! State management module for Stratum stacks.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources: provider ids, applied inputs, outputs, recorded dependencies
//! and run history.

mod store;
mod local;
mod lock;
mod types;

pub use store::StateStore;
pub use local::LocalStateStore;
pub use lock::{LockInfo, LOCK_EXPIRY_SECS, generate_holder_id};
pub use types::{ResourceRecord, RunHistoryEntry, RunOperation, STATE_VERSION, StateSnapshot};
