//! Structural diff between two trees.
//!
//! Subtrees that are pointer-identical in both trees are skipped without
//! being looked at, so the cost of a diff is proportional to what was
//! copied on write rather than to the size of the tree.

use crate::nodes::Node;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Which changed paths to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaMode {
    /// Only the highest paths that actually changed.
    Minimal,
    /// Minimal changes plus every ancestor of one.
    Parents,
    /// Parents, plus every node inside an added or removed subtree.
    Full,
}

/// How a reported path relates to the minimal change set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaElemTag {
    Minimal,
    NotMinimal,
}

/// One reported change.
#[derive(Clone, Copy, Debug)]
pub struct DeltaElem<'a> {
    pub path: &'a [String],
    pub old: Option<&'a Arc<Node>>,
    pub new: Option<&'a Arc<Node>>,
    pub tag: DeltaElemTag,
}

impl DeltaElem<'_> {
    pub fn is_added(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.old.is_some() && self.new.is_none()
    }
}

pub trait DeltaVisitor {
    fn visit(&mut self, elem: DeltaElem<'_>);

    /// Return false to skip the children of `path`. A skipped container is
    /// still reported as changed.
    fn should_descend(&mut self, _path: &[String]) -> bool {
        true
    }
}

impl<F> DeltaVisitor for F
where
    F: FnMut(DeltaElem<'_>),
{
    fn visit(&mut self, elem: DeltaElem<'_>) {
        self(elem)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeltaOptions {
    pub mode: DeltaMode,
    /// Report struct members by numeric id instead of name.
    pub use_id_paths: bool,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            mode: DeltaMode::Parents,
            use_id_paths: false,
        }
    }
}

/// Diff `old` against `new`. Returns true if anything changed.
///
/// Changed containers are reported after their children; inside added or
/// removed subtrees the subtree root is reported before its descendants.
pub fn visit_delta<V: DeltaVisitor>(
    old: &Arc<Node>,
    new: &Arc<Node>,
    options: DeltaOptions,
    visitor: &mut V,
) -> bool {
    let mut walker = Walker {
        options,
        visitor,
        path: Vec::new(),
    };
    walker.diff(old, new)
}

struct Walker<'v, V> {
    options: DeltaOptions,
    visitor: &'v mut V,
    path: Vec<String>,
}

impl<V: DeltaVisitor> Walker<'_, V> {
    fn emit(&mut self, old: Option<&Arc<Node>>, new: Option<&Arc<Node>>, tag: DeltaElemTag) {
        if tag == DeltaElemTag::NotMinimal && self.options.mode == DeltaMode::Minimal {
            return;
        }
        self.visitor.visit(DeltaElem {
            path: &self.path,
            old,
            new,
            tag,
        });
    }

    fn diff(&mut self, old: &Arc<Node>, new: &Arc<Node>) -> bool {
        if Arc::ptr_eq(old, new) {
            return false;
        }
        match (old.as_ref(), new.as_ref()) {
            (Node::Primitive { value: a, .. }, Node::Primitive { value: b, .. }) => {
                if a == b {
                    return false;
                }
                self.emit(Some(old), Some(new), DeltaElemTag::Minimal);
                true
            }
            (o, n) if o.same_shape(n) => {
                let changed = if self.visitor.should_descend(&self.path) {
                    self.diff_children(o, n)
                } else {
                    true
                };
                if changed {
                    self.emit(Some(old), Some(new), DeltaElemTag::NotMinimal);
                }
                changed
            }
            _ => {
                self.emit(Some(old), Some(new), DeltaElemTag::Minimal);
                true
            }
        }
    }

    fn diff_opt(&mut self, token: String, old: Option<&Arc<Node>>, new: Option<&Arc<Node>>) -> bool {
        self.path.push(token);
        let changed = match (old, new) {
            (Some(o), Some(n)) => self.diff(o, n),
            (None, None) => false,
            (o, n) => {
                self.subtree(o, n);
                true
            }
        };
        self.path.pop();
        changed
    }

    fn diff_children(&mut self, old: &Node, new: &Node) -> bool {
        let use_id = self.options.use_id_paths;
        let mut changed = false;
        match (old, new) {
            (
                Node::Struct {
                    schema,
                    fields: old_fields,
                },
                Node::Struct {
                    fields: new_fields, ..
                },
            ) => {
                for (i, (o, n)) in old_fields.iter().zip(new_fields).enumerate() {
                    if o.is_none() && n.is_none() {
                        continue;
                    }
                    changed |= self.diff_opt(schema.field_token(i, use_id), o.as_ref(), n.as_ref());
                }
            }
            (
                Node::Variant {
                    schema,
                    active: old_active,
                },
                Node::Variant {
                    active: new_active, ..
                },
            ) => match (old_active, new_active) {
                (Some((a, o)), Some((b, n))) if a == b => {
                    changed |= self.diff_opt(schema.field_token(*a, use_id), Some(o), Some(n));
                }
                _ => {
                    if let Some((a, o)) = old_active {
                        changed |= self.diff_opt(schema.field_token(*a, use_id), Some(o), None);
                    }
                    if let Some((b, n)) = new_active {
                        changed |= self.diff_opt(schema.field_token(*b, use_id), None, Some(n));
                    }
                }
            },
            (Node::List { items: o, .. }, Node::List { items: n, .. }) => {
                for i in 0..o.len().max(n.len()) {
                    changed |= self.diff_opt(i.to_string(), o.get(i), n.get(i));
                }
            }
            (Node::Map { entries: o, .. }, Node::Map { entries: n, .. })
            | (Node::Set { members: o, .. }, Node::Set { members: n, .. }) => {
                let keys: BTreeSet<_> = o.keys().chain(n.keys()).collect();
                for k in keys {
                    changed |= self.diff_opt(k.to_string(), o.get(k), n.get(k));
                }
            }
            _ => {}
        }
        changed
    }

    /// Report an added or removed subtree rooted at the current path.
    fn subtree(&mut self, old: Option<&Arc<Node>>, new: Option<&Arc<Node>>) {
        self.emit(old, new, DeltaElemTag::Minimal);
        if self.options.mode != DeltaMode::Full {
            return;
        }
        if let Some(node) = old.or(new) {
            self.descendants(node, old.is_some());
        }
    }

    fn descendants(&mut self, node: &Arc<Node>, removed: bool) {
        if !self.visitor.should_descend(&self.path) {
            return;
        }
        for (token, child) in node.children(self.options.use_id_paths) {
            self.path.push(token);
            if removed {
                self.emit(Some(child), None, DeltaElemTag::NotMinimal);
            } else {
                self.emit(None, Some(child), DeltaElemTag::NotMinimal);
            }
            self.descendants(child, removed);
            self.path.pop();
        }
    }
}
