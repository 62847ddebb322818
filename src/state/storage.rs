//! Published roots and the copy-on-write working tree.

use super::patch;
use crate::error::{Result, StoreError, TraverseResult};
use crate::nodes::Node;
use crate::schema::{StructSchema, TypeDesc};
use crate::types::{ConcretePath, Delta, DeltaUnit, ExtendedPath, Patch, Protocol};
use crate::visitors::{modify_path, traverse, visit_extended, visit_path, CompiledPath, RegexCache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// An immutable snapshot of the whole tree.
///
/// Cloning a root is cheap and shares every node. Two roots are the same
/// snapshot when they share the top-level node; see [`Root::is_same`].
#[derive(Clone)]
pub struct Root {
    node: Arc<Node>,
    schema: Arc<StructSchema>,
}

impl Root {
    /// A tree with every required member default-constructed.
    pub fn new(schema: Arc<StructSchema>) -> Self {
        let node = Arc::new(Node::new(&TypeDesc::Struct(schema.clone())));
        Self { node, schema }
    }

    pub fn from_json(schema: Arc<StructSchema>, json: &serde_json::Value) -> Result<Self> {
        let node = Node::from_json(&TypeDesc::Struct(schema.clone()), json)?;
        Ok(Self {
            node: Arc::new(node),
            schema,
        })
    }

    pub fn schema(&self) -> &Arc<StructSchema> {
        &self.schema
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn type_desc(&self) -> TypeDesc {
        TypeDesc::Struct(self.schema.clone())
    }

    /// True if both roots are the same snapshot.
    pub fn is_same(&self, other: &Root) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.node.to_json()
    }

    /// Read the value at `path` as `T`.
    ///
    /// Fails with `InvalidPath` if a hop does not resolve and with
    /// `TypeError` if the value there does not deserialize as `T`.
    pub fn get<T: DeserializeOwned, S: AsRef<str>>(&self, path: &[S]) -> Result<T> {
        read_typed(&self.node, path)
    }

    pub fn get_json<S: AsRef<str>>(&self, path: &[S]) -> Result<serde_json::Value> {
        Ok(visit_path(&self.node, path)?.to_json())
    }

    pub fn get_encoded<S: AsRef<str>>(&self, path: &[S], protocol: Protocol) -> Result<Vec<u8>> {
        visit_path(&self.node, path)?.encode(protocol)
    }

    pub fn get_node<S: AsRef<str>>(&self, path: &[S]) -> Option<&Arc<Node>> {
        traverse(&self.node, path).ok()
    }

    pub fn exists<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.get_node(path).is_some()
    }

    /// Every concrete path matching `path`, with its encoded value.
    pub fn get_encoded_extended(
        &self,
        path: &ExtendedPath,
        protocol: Protocol,
    ) -> Result<Vec<(ConcretePath, Vec<u8>)>> {
        self.get_encoded_extended_with(path, protocol, None, false)
    }

    pub(crate) fn get_encoded_extended_with(
        &self,
        path: &ExtendedPath,
        protocol: Protocol,
        cache: Option<&RegexCache>,
        use_id_paths: bool,
    ) -> Result<Vec<(ConcretePath, Vec<u8>)>> {
        let compiled = CompiledPath::compile(path, cache)?;
        let mut matches = Vec::new();
        visit_extended(&self.node, &compiled, use_id_paths, |p, node| {
            matches.push((p.to_vec(), node.clone()));
        });
        matches
            .into_iter()
            .map(|(p, node)| Ok((p, node.encode(protocol)?)))
            .collect()
    }

    /// Start a working copy of this snapshot.
    pub fn storage(&self) -> CowStorage {
        CowStorage {
            root: self.node.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("schema", &self.schema.name)
            .field("node", &Arc::as_ptr(&self.node))
            .finish()
    }
}

fn read_typed<T: DeserializeOwned, S: AsRef<str>>(root: &Arc<Node>, path: &[S]) -> Result<T> {
    let json = visit_path(root, path)?.to_json();
    serde_json::from_value(json).map_err(|e| {
        StoreError::TypeError(format!("value at /{}: {}", crate::error::join_path(path), e))
    })
}

/// A writable tree built on top of a published root.
///
/// Nodes shared with the source root are copied the first time they are
/// written to. Nodes this storage already copied are written in place.
pub struct CowStorage {
    root: Arc<Node>,
    schema: Arc<StructSchema>,
}

impl CowStorage {
    pub fn new(schema: Arc<StructSchema>) -> Self {
        Root::new(schema).storage()
    }

    pub fn schema(&self) -> &Arc<StructSchema> {
        &self.schema
    }

    pub(crate) fn root_node(&self) -> &Arc<Node> {
        &self.root
    }

    pub(crate) fn root_node_mut(&mut self) -> &mut Arc<Node> {
        &mut self.root
    }

    fn type_desc(&self) -> TypeDesc {
        TypeDesc::Struct(self.schema.clone())
    }

    pub fn get<T: DeserializeOwned, S: AsRef<str>>(&self, path: &[S]) -> Result<T> {
        read_typed(&self.root, path)
    }

    pub fn get_encoded<S: AsRef<str>>(&self, path: &[S], protocol: Protocol) -> Result<Vec<u8>> {
        visit_path(&self.root, path)?.encode(protocol)
    }

    /// Write `value` at `path`, creating missing intermediate nodes.
    ///
    /// The path and the value are both checked against the schema before
    /// anything is touched, so a failed write leaves the tree unchanged.
    pub fn set<T: Serialize + ?Sized, S: AsRef<str>>(&mut self, path: &[S], value: &T) -> Result<()> {
        let json = serde_json::to_value(value)?;
        self.set_json(path, &json)
    }

    pub fn set_json<S: AsRef<str>>(&mut self, path: &[S], json: &serde_json::Value) -> Result<()> {
        let ty = self.type_desc().resolve(path)?;
        let node = Node::from_json(&ty, json)?;
        self.set_node(path, node)
    }

    pub fn set_encoded<S: AsRef<str>>(
        &mut self,
        path: &[S],
        bytes: &[u8],
        protocol: Protocol,
    ) -> Result<()> {
        let ty = self.type_desc().resolve(path)?;
        let node = Node::decode(&ty, protocol, bytes)?;
        self.set_node(path, node)
    }

    fn set_node<S: AsRef<str>>(&mut self, path: &[S], node: Node) -> Result<()> {
        let slot = modify_path(&mut self.root, path, true)?;
        *slot = Arc::new(node);
        Ok(())
    }

    /// Remove the node at `path`.
    ///
    /// Removing something already absent succeeds without touching the
    /// tree. A missing or invalid intermediate hop is `InvalidPath`, and
    /// removing a required member is a `TypeError`. Removing the root
    /// resets the tree to its defaults.
    pub fn remove<S: AsRef<str>>(&mut self, path: &[S]) -> Result<()> {
        let Some((last, parent)) = path.split_last() else {
            self.root = Arc::new(Node::new(&self.type_desc()));
            return Ok(());
        };
        self.type_desc().resolve(path)?;
        let parent_node = visit_path(&self.root, parent)?;
        if parent_node.child(last.as_ref()).is_err() {
            return Ok(());
        }
        let slot = modify_path(&mut self.root, parent, false)?;
        Arc::make_mut(slot).remove_child(path)?;
        Ok(())
    }

    /// Apply a structural patch.
    pub fn patch(&mut self, patch: &Patch) -> Result<()> {
        patch::apply_patch(self, patch)
    }

    /// Apply each unit of `delta` in order.
    ///
    /// Units are not applied atomically: every unit that can be applied is,
    /// and the first failure is returned afterwards.
    pub fn patch_delta(&mut self, delta: &Delta) -> Result<()> {
        let mut first_error = None;
        for unit in &delta.changes {
            if let Err(e) = self.apply_delta_unit(unit, delta.protocol) {
                debug!(path = %crate::error::join_path(&unit.path), error = %e, "delta unit rejected");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_delta_unit(&mut self, unit: &DeltaUnit, protocol: Protocol) -> Result<()> {
        match (&unit.old, &unit.new) {
            (_, Some(new)) => self.set_encoded(&unit.path, new, protocol),
            (Some(_), None) => self.remove(&unit.path),
            (None, None) if unit.path.is_empty() => Ok(()),
            (None, None) => Err(StoreError::invalid_path(
                &unit.path,
                unit.path.len() - 1,
                TraverseResult::NonExistentNode,
            )),
        }
    }

    /// True if this storage has diverged from `root`.
    pub fn is_modified_from(&self, root: &Root) -> bool {
        !Arc::ptr_eq(&self.root, root.node())
    }

    /// Freeze the working tree into a shareable snapshot.
    pub fn publish(self) -> Root {
        Root {
            node: self.root,
            schema: self.schema,
        }
    }
}
