//! Literal path traversal.

use crate::error::{Result, StoreError, TraverseResult};
use crate::nodes::Node;
use crate::schema::TypeDesc;
use crate::types::ConcretePath;
use std::sync::Arc;

/// Walk `path` from `root` without modifying anything.
///
/// On failure returns the depth of the failing hop and why it failed.
pub fn traverse<'a, S: AsRef<str>>(
    root: &'a Arc<Node>,
    path: &[S],
) -> std::result::Result<&'a Arc<Node>, (usize, TraverseResult)> {
    let mut node = root;
    for (depth, token) in path.iter().enumerate() {
        node = node.child(token.as_ref()).map_err(|r| (depth, r))?;
    }
    Ok(node)
}

/// Like [`traverse`], with the failure rendered as `InvalidPath`.
pub fn visit_path<'a, S: AsRef<str>>(root: &'a Arc<Node>, path: &[S]) -> Result<&'a Arc<Node>> {
    traverse(root, path).map_err(|(depth, reason)| StoreError::invalid_path(path, depth, reason))
}

/// Walk `path` for writing, copying shared nodes on the way down.
///
/// Every node above the target is made exclusively owned via
/// `Arc::make_mut`; nodes already owned by this writer are reused as-is.
/// The returned slot itself is not copied, the caller replaces or edits it.
pub fn modify_path<'a, S: AsRef<str>>(
    root: &'a mut Arc<Node>,
    path: &[S],
    create: bool,
) -> Result<&'a mut Arc<Node>> {
    let mut slot = root;
    for (depth, token) in path.iter().enumerate() {
        slot = Arc::make_mut(slot)
            .child_slot(token.as_ref(), create)
            .map_err(|reason| StoreError::invalid_path(path, depth, reason))?;
    }
    Ok(slot)
}

/// Rewrite every token of `path` to its canonical output form.
///
/// Struct members become names (or ids with `use_id`), enum keys become
/// their integer form. Fails if any hop is invalid for the schema.
pub fn canonicalize_path<S: AsRef<str>>(
    ty: &TypeDesc,
    path: &[S],
    use_id: bool,
) -> Result<ConcretePath> {
    let mut ty = ty.clone();
    let mut out = Vec::with_capacity(path.len());
    for (depth, token) in path.iter().enumerate() {
        let token = token.as_ref();
        let next = ty
            .child(token)
            .map_err(|reason| StoreError::invalid_path(path, depth, reason))?;
        out.push(
            ty.canonical_token(token, use_id)
                .unwrap_or_else(|| token.to_string()),
        );
        ty = next;
    }
    Ok(out)
}
