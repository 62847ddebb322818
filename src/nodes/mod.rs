//! Schema-typed tree nodes.
//!
//! A tree is a closed sum over struct, variant, list, map, set and
//! primitive nodes. Children live behind `Arc` so unchanged subtrees are
//! shared between successive roots.

mod codec;
mod node;

pub(crate) use codec::parse_key_token;
pub use node::{Node, Value};
