//! Tree traversal algorithms.
//!
//! - [`path`]: resolve a literal path, for reading or copy-on-write
//! - [`extended`]: fan an extended path out over matching children
//! - [`delta`]: diff two trees, skipping shared subtrees

pub mod delta;
pub mod extended;
pub mod path;

pub use delta::{visit_delta, DeltaElem, DeltaElemTag, DeltaMode, DeltaOptions, DeltaVisitor};
pub use extended::{matching_children, visit_extended, CompiledPath, ElemMatcher, RegexCache};
pub use path::{canonicalize_path, modify_path, traverse, visit_path};
