//! Subscriptions to live tree changes.
//!
//! A subscription names one or more paths, each either concrete or
//! extended (containing regex or wildcard segments). Every path gets one
//! initial full-sync item, then incremental items as published roots
//! change it:
//! - `Path` mode: the whole value at the path
//! - `Delta` mode: `(path, old, new)` units for changes at or below it
//! - `Patch` mode: a structural patch rooted at the path
//!
//! Subscriptions are indexed in a path trie. Extended paths resolve lazily:
//! they only produce concrete subscriptions once a matching path exists.
//! Each subscription has a bounded buffer; a subscriber that falls behind
//! is disconnected with `BufferOverflow`.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(root, SubscriptionConfig::default());
//!
//! let request = SubscriptionRequest::new("lldp-agent")
//!     .extended("ports", ExtendedPath::new().raw("ports").regex("eth[0-9]+").raw("operState"))
//!     .mode(SubscriptionMode::Delta);
//! let handle = manager.subscribe(request)?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SubscriptionEvent::Delta { key, delta }) => apply(key, delta),
//!         Ok(SubscriptionEvent::Terminated { code }) => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod path_store;
mod publishers;
mod types;

pub use manager::SubscriptionManager;
pub use path_store::{LookupKinds, PendingMarker, Promotion, SubscriptionPathStore, SubscriptionRef};
pub use publishers::{AccessPolicy, AllowAll, PublisherInfo, PublisherRegistry, Registration};
pub use types::{
    SubscriptionConfig, SubscriptionEvent, SubscriptionHandle, SubscriptionId, SubscriptionMode,
    SubscriptionPath, SubscriptionRequest, SubscriptionState, TerminationCode,
};
