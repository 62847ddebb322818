//! # State Store
//!
//! An in-memory, schema-typed, path-addressable state tree with
//! copy-on-write snapshots and path subscriptions.
//!
//! ## Core Concepts
//!
//! - **Roots**: Immutable snapshots that share unchanged subtrees
//! - **Paths**: Literal token paths, or extended paths with regex and
//!   wildcard segments
//! - **Patches and deltas**: Structural diffs and flat `(path, old, new)`
//!   change lists
//! - **Subscriptions**: Bounded streams of changes under a path, resolved
//!   lazily for extended paths
//! - **Updates**: Mutations serialized onto one writer thread and batched
//!
//! ## Example
//!
//! ```ignore
//! use state_store::{StructSchema, SubscribableStore, StoreConfig, SubscriptionRequest, TypeDesc};
//!
//! let schema = StructSchema::builder("Switch")
//!     .field(1, "hostname", TypeDesc::string())
//!     .field(2, "txEnabled", TypeDesc::bool())
//!     .build();
//! let store = SubscribableStore::new(schema, StoreConfig::default());
//!
//! let handle = store.subscribe(SubscriptionRequest::new("cli").path("tx", &["txEnabled"]))?;
//! store.set(&["txEnabled"], &true)?;
//!
//! let before = store.root();
//! store.set(&["hostname"], "leaf-1")?;
//! assert_eq!(before.get::<String, _>(&["hostname"])?, "");
//! ```

pub mod error;
pub mod nodes;
pub mod schema;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod updates;
pub mod visitors;

// Re-exports
pub use error::{join_path, Result, StoreError, TraverseResult};
pub use nodes::{Node, Value};
pub use schema::{EnumSchema, FieldSchema, Key, PrimitiveKind, StructSchema, TypeDesc};
pub use state::{apply_patch, build_patch, CowStorage, Root};
pub use store::{StoreConfig, StoreStats, SubscribableStore};
pub use subscriptions::{
    AccessPolicy, AllowAll, SubscriptionConfig, SubscriptionEvent, SubscriptionHandle,
    SubscriptionId, SubscriptionManager, SubscriptionMode, SubscriptionPath, SubscriptionRequest,
    SubscriptionState, TerminationCode,
};
pub use types::*;
pub use updates::{PendingUpdate, UpdateManager};
pub use visitors::{visit_delta, DeltaElem, DeltaElemTag, DeltaMode, DeltaOptions};
