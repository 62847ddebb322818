//! Copy-on-write state.
//!
//! A [`Root`] is an immutable snapshot that any number of readers may hold.
//! Writers call [`Root::storage`] to get a [`CowStorage`], mutate it, and
//! [`CowStorage::publish`] the result as a new root. Unchanged subtrees are
//! shared between the old and new roots.
//!
//! # Example
//!
//! ```ignore
//! let root = Root::new(schema);
//! let mut storage = root.storage();
//! storage.set(&["ports", "1", "name"], &"eth0")?;
//! let next = storage.publish();
//!
//! assert!(!next.is_same(&root));
//! let name: String = next.get(&["ports", "1", "name"])?;
//! ```

mod patch;
mod storage;

pub use patch::{apply_patch, build_patch};
pub use storage::{CowStorage, Root};
