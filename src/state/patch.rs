//! Structural patch application and construction.

use super::storage::CowStorage;
use crate::error::{join_path, Result, StoreError, TraverseResult};
use crate::nodes::{parse_key_token, Node};
use crate::types::{Patch, PatchNode, Protocol, ValuePatch, VariantPatch};
use crate::visitors::{modify_path, traverse};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Apply `patch` to the working tree.
///
/// A replacement leaf may target a path that does not exist yet; every
/// other patch shape needs its base path to exist. A patch whose shape
/// does not fit the node it lands on is a `TypeError`.
pub fn apply_patch(storage: &mut CowStorage, patch: &Patch) -> Result<()> {
    let base = &patch.base_path;
    match &patch.patch {
        PatchNode::Delete => return storage.remove(base),
        PatchNode::Value(v) => return storage.set_encoded(base, &v.value, v.protocol),
        _ => {}
    }
    if let Err((depth, reason)) = traverse(storage.root_node(), base) {
        return Err(StoreError::invalid_path(base, depth, reason));
    }
    let slot = modify_path(storage.root_node_mut(), base, false)?;
    let mut path = base.clone();
    apply_node(slot, &patch.patch, &mut path)
}

fn apply_node(slot: &mut Arc<Node>, patch: &PatchNode, path: &mut Vec<String>) -> Result<()> {
    match patch {
        PatchNode::Value(v) => {
            let ty = slot.type_desc();
            *slot = Arc::new(Node::decode(&ty, v.protocol, &v.value)?);
            Ok(())
        }
        PatchNode::Delete => Err(StoreError::TypeError(format!(
            "delete at /{} must be addressed through its parent",
            join_path(path.as_slice())
        ))),
        PatchNode::StructFields(fields) => apply_struct(slot, fields, path),
        PatchNode::Variant(vp) => apply_variant(slot, vp, path),
        PatchNode::Entries(entries) => apply_entries(slot, entries, path),
    }
}

fn shape_error(node: &Node, patch: &str, path: &[String]) -> StoreError {
    StoreError::TypeError(format!(
        "{} patch does not apply to {} at /{}",
        patch,
        node.kind_name(),
        join_path(path)
    ))
}

fn apply_struct(
    slot: &mut Arc<Node>,
    fields: &BTreeMap<u16, PatchNode>,
    path: &mut Vec<String>,
) -> Result<()> {
    let schema = match slot.as_ref() {
        Node::Struct { schema, .. } => schema.clone(),
        other => return Err(shape_error(other, "struct", path)),
    };
    if fields.is_empty() {
        return Ok(());
    }
    let node = Arc::make_mut(slot);
    for (id, sub) in fields {
        let idx = schema.field_index_by_id(*id).ok_or_else(|| {
            StoreError::TypeError(format!("{} has no member with id {}", schema.name, id))
        })?;
        path.push(schema.fields[idx].name.clone());
        let result = apply_child(node, sub, path);
        path.pop();
        result?;
    }
    Ok(())
}

fn apply_variant(slot: &mut Arc<Node>, vp: &VariantPatch, path: &mut Vec<String>) -> Result<()> {
    let schema = match slot.as_ref() {
        Node::Variant { schema, .. } => schema.clone(),
        other => return Err(shape_error(other, "variant", path)),
    };
    let idx = schema.field_index_by_id(vp.case_id).ok_or_else(|| {
        StoreError::TypeError(format!("{} has no case with id {}", schema.name, vp.case_id))
    })?;
    path.push(schema.fields[idx].name.clone());
    let result = apply_child(Arc::make_mut(slot), &vp.patch, path);
    path.pop();
    result
}

fn apply_entries(
    slot: &mut Arc<Node>,
    entries: &BTreeMap<String, PatchNode>,
    path: &mut Vec<String>,
) -> Result<()> {
    if matches!(slot.as_ref(), Node::List { .. }) {
        return apply_list_entries(slot, entries, path);
    }
    let (key, is_set) = match slot.as_ref() {
        Node::Map { key, .. } => (key.clone(), false),
        Node::Set { kind, .. } => (kind.clone(), true),
        other => return Err(shape_error(other, "entries", path)),
    };
    for token in entries.keys() {
        parse_key_token(&key, token)?;
    }
    if entries.is_empty() {
        return Ok(());
    }
    let node = Arc::make_mut(slot);
    for (token, sub) in entries {
        path.push(token.clone());
        let result = if is_set && !matches!(sub, PatchNode::Delete) {
            // Set members carry no payload beyond their key.
            node.child_slot(token, true).map(|_| ()).map_err(|reason| {
                StoreError::invalid_path(path.as_slice(), path.len() - 1, reason)
            })
        } else {
            apply_child(node, sub, path)
        };
        path.pop();
        result?;
    }
    Ok(())
}

/// List entries: writes first in ascending index order, then deletes from
/// the highest index down so earlier deletes do not shift later ones.
fn apply_list_entries(
    slot: &mut Arc<Node>,
    entries: &BTreeMap<String, PatchNode>,
    path: &mut Vec<String>,
) -> Result<()> {
    let mut writes = BTreeMap::new();
    let mut deletes = BTreeSet::new();
    for (token, sub) in entries {
        let idx: usize = token.parse().map_err(|_| {
            StoreError::TypeError(format!(
                "{:?} is not a list index at /{}",
                token,
                join_path(path.as_slice())
            ))
        })?;
        match sub {
            PatchNode::Delete => {
                deletes.insert(idx);
            }
            other => {
                writes.insert(idx, other);
            }
        }
    }
    if writes.is_empty() && deletes.is_empty() {
        return Ok(());
    }
    let mut len = match slot.as_ref() {
        Node::List { items, .. } => items.len(),
        other => return Err(shape_error(other, "entries", path)),
    };
    for &idx in writes.keys() {
        if idx > len {
            path.push(idx.to_string());
            let err = StoreError::invalid_path(
                path.as_slice(),
                path.len() - 1,
                TraverseResult::InvalidArrayIndex,
            );
            path.pop();
            return Err(err);
        }
        if idx == len {
            len += 1;
        }
    }
    let node = Arc::make_mut(slot);
    for (idx, sub) in writes {
        path.push(idx.to_string());
        let result = apply_child(node, sub, path);
        path.pop();
        result?;
    }
    for idx in deletes.into_iter().rev() {
        path.push(idx.to_string());
        let result = node.remove_child(path.as_slice());
        path.pop();
        result?;
    }
    Ok(())
}

/// Apply `sub` to the child of `parent` named by the last token of `path`.
fn apply_child(parent: &mut Node, sub: &PatchNode, path: &mut Vec<String>) -> Result<()> {
    if let PatchNode::Delete = sub {
        return parent.remove_child(path.as_slice()).map(|_| ());
    }
    let token = path.last().cloned().unwrap_or_default();
    let child = parent
        .child_slot(&token, true)
        .map_err(|reason| StoreError::invalid_path(path.as_slice(), path.len() - 1, reason))?;
    apply_node(child, sub, path)
}

/// Build the patch that turns `old` into `new`.
///
/// Returns `None` when nothing changed.
pub fn build_patch(
    old: Option<&Arc<Node>>,
    new: Option<&Arc<Node>>,
    protocol: Protocol,
) -> Result<Option<PatchNode>> {
    match (old, new) {
        (None, None) => Ok(None),
        (Some(_), None) => Ok(Some(PatchNode::Delete)),
        (None, Some(n)) => replace(n, protocol).map(Some),
        (Some(o), Some(n)) => diff(o, n, protocol),
    }
}

fn replace(node: &Node, protocol: Protocol) -> Result<PatchNode> {
    Ok(PatchNode::Value(ValuePatch {
        value: node.encode(protocol)?,
        protocol,
    }))
}

fn diff(old: &Arc<Node>, new: &Arc<Node>, protocol: Protocol) -> Result<Option<PatchNode>> {
    if Arc::ptr_eq(old, new) {
        return Ok(None);
    }
    let patch = match (old.as_ref(), new.as_ref()) {
        (Node::Primitive { value: a, .. }, Node::Primitive { value: b, .. }) => {
            if a == b {
                return Ok(None);
            }
            replace(new, protocol)?
        }
        (
            Node::Struct {
                schema,
                fields: of,
            },
            Node::Struct { fields: nf, .. },
        ) if old.same_shape(new) => {
            let mut out = BTreeMap::new();
            for (i, (o, n)) in of.iter().zip(nf).enumerate() {
                if let Some(sub) = build_patch(o.as_ref(), n.as_ref(), protocol)? {
                    out.insert(schema.fields[i].id, sub);
                }
            }
            PatchNode::StructFields(out)
        }
        (
            Node::Variant {
                schema,
                active: Some((a, o)),
            },
            Node::Variant {
                active: Some((b, n)),
                ..
            },
        ) if a == b && old.same_shape(new) => match diff(o, n, protocol)? {
            Some(sub) => PatchNode::Variant(VariantPatch {
                case_id: schema.fields[*a].id,
                patch: Box::new(sub),
            }),
            None => return Ok(None),
        },
        (Node::List { items: o, .. }, Node::List { items: n, .. }) => {
            let mut out = BTreeMap::new();
            for i in 0..o.len().max(n.len()) {
                if let Some(sub) = build_patch(o.get(i), n.get(i), protocol)? {
                    out.insert(i.to_string(), sub);
                }
            }
            PatchNode::Entries(out)
        }
        (Node::Map { entries: o, .. }, Node::Map { entries: n, .. })
        | (Node::Set { members: o, .. }, Node::Set { members: n, .. }) => {
            let mut out = BTreeMap::new();
            let keys: BTreeSet<_> = o.keys().chain(n.keys()).collect();
            for k in keys {
                if let Some(sub) = build_patch(o.get(k), n.get(k), protocol)? {
                    out.insert(k.to_string(), sub);
                }
            }
            PatchNode::Entries(out)
        }
        _ => replace(new, protocol)?,
    };
    Ok((!patch.is_empty()).then_some(patch))
}
