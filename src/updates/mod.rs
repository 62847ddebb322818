//! Serialized application of mutations.
//!
//! Every mutation of a store goes through one [`UpdateManager`], which
//! applies queued [`PendingUpdate`]s on its own thread:
//!
//! 1. Take a run of coalescing updates, or one non-coalescing update
//! 2. Apply them in order, each to the root the previous one produced
//! 3. Drop failed updates (their `on_error` fires) without touching the rest
//! 4. If the root changed, publish it and fire the state callback once,
//!    then fire `on_success` for every update that applied
//!
//! # Example
//!
//! ```ignore
//! let updates = UpdateManager::new(root);
//! updates.set_state_callback(|old, new| subscriptions.serve(old, new));
//!
//! updates.enqueue_blocking(PendingUpdate::with_storage("admin-down", |s| {
//!     s.set(&["ports", "eth0", "adminState"], &"DOWN")
//! }))?;
//! ```

mod manager;

pub use manager::{PendingUpdate, StateCallback, UpdateManager};
