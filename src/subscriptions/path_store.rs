//! Trie index of subscriptions by path.
//!
//! Each trie node holds the subscriptions anchored exactly at its path and
//! the pending markers of extended subscriptions waiting for a matching
//! child to appear. Every node also keeps counts of what is anchored
//! strictly below it. The counts are updated on every mutation and never
//! recomputed by walking, so "is anyone interested below here?" is O(1).
//!
//! Trie nodes are created lazily and pruned as soon as they hold nothing.

use super::types::SubscriptionId;
use crate::nodes::Node;
use crate::types::ConcretePath;
use crate::visitors::{matching_children, CompiledPath};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A subscription anchored at a trie node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionRef {
    pub id: SubscriptionId,
    /// Key of the path within the subscription request.
    pub key: String,
    /// True if produced by resolving an extended path.
    pub resolved: bool,
}

/// An extended subscription waiting for a child matching `pattern[elem]`.
#[derive(Clone, Debug)]
pub struct PendingMarker {
    pub id: SubscriptionId,
    pub key: String,
    pub pattern: Arc<CompiledPath>,
    pub elem: usize,
    /// Anchored markers sit at the end of the literal prefix and live as
    /// long as the subscription. The rest are derived from tree paths and
    /// go away with them.
    pub anchored: bool,
}

impl PendingMarker {
    fn same_as(&self, other: &PendingMarker) -> bool {
        self.id == other.id && self.key == other.key && self.elem == other.elem
    }

    fn matches(&self, token: &str) -> bool {
        self.pattern
            .elems()
            .get(self.elem)
            .is_some_and(|m| m.matches(token))
    }
}

/// A resolved subscription created by [`SubscriptionPathStore::process_added_path`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promotion {
    pub id: SubscriptionId,
    pub key: String,
    pub path: ConcretePath,
}

/// Which subscriptions [`SubscriptionPathStore::find`] returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookupKinds {
    /// Anchored exactly at the path.
    pub target: bool,
    /// Anchored at a strict ancestor.
    pub parents: bool,
    /// Anchored at a strict descendant.
    pub children: bool,
}

impl LookupKinds {
    pub const TARGET: Self = Self {
        target: true,
        parents: false,
        children: false,
    };
    pub const PARENTS: Self = Self {
        target: false,
        parents: true,
        children: false,
    };
    pub const CHILDREN: Self = Self {
        target: false,
        parents: false,
        children: true,
    };
    pub const ALL: Self = Self {
        target: true,
        parents: true,
        children: true,
    };
}

#[derive(Default)]
struct PathStoreNode {
    children: BTreeMap<String, PathStoreNode>,
    subs: Vec<SubscriptionRef>,
    markers: Vec<PendingMarker>,
    num_child_subs: usize,
    num_child_markers: usize,
}

impl PathStoreNode {
    fn num_subs_recursive(&self) -> usize {
        self.subs.len() + self.num_child_subs
    }

    fn num_markers_recursive(&self) -> usize {
        self.markers.len() + self.num_child_markers
    }

    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.markers.is_empty() && self.children.is_empty()
    }

    fn collect_descendants(&self, out: &mut Vec<SubscriptionRef>) {
        if self.num_child_subs == 0 {
            return;
        }
        for child in self.children.values() {
            out.extend(child.subs.iter().cloned());
            child.collect_descendants(out);
        }
    }

    fn count_nodes(&self) -> usize {
        1 + self.children.values().map(|c| c.count_nodes()).sum::<usize>()
    }
}

type SubFilter<'a> = &'a dyn Fn(&SubscriptionRef) -> bool;
type MarkerFilter<'a> = &'a dyn Fn(&PendingMarker) -> bool;

/// Removes matching entries at `node` and, with `subtree`, everywhere below.
/// Returns how many subscriptions and markers went away.
fn purge(
    node: &mut PathStoreNode,
    subs: SubFilter<'_>,
    markers: MarkerFilter<'_>,
    subtree: bool,
) -> (usize, usize) {
    let mut removed = (0, 0);
    if subtree {
        for child in node.children.values_mut() {
            let (s, m) = purge(child, subs, markers, true);
            node.num_child_subs -= s;
            node.num_child_markers -= m;
            removed.0 += s;
            removed.1 += m;
        }
        node.children.retain(|_, c| !c.is_empty());
    }
    let before = (node.subs.len(), node.markers.len());
    node.subs.retain(|s| !subs(s));
    node.markers.retain(|m| !markers(m));
    removed.0 += before.0 - node.subs.len();
    removed.1 += before.1 - node.markers.len();
    removed
}

fn purge_at(
    node: &mut PathStoreNode,
    path: &[String],
    subs: SubFilter<'_>,
    markers: MarkerFilter<'_>,
    subtree: bool,
) -> (usize, usize) {
    let Some((head, rest)) = path.split_first() else {
        return purge(node, subs, markers, subtree);
    };
    let Some(child) = node.children.get_mut(head) else {
        return (0, 0);
    };
    let (s, m) = purge_at(child, rest, subs, markers, subtree);
    let empty = child.is_empty();
    node.num_child_subs -= s;
    node.num_child_markers -= m;
    if empty {
        node.children.remove(head);
    }
    (s, m)
}

/// The subscription trie.
#[derive(Default)]
pub struct SubscriptionPathStore {
    root: PathStoreNode,
}

impl SubscriptionPathStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, path: &[String]) -> Option<&PathStoreNode> {
        let mut node = &self.root;
        for token in path {
            node = node.children.get(token)?;
        }
        Some(node)
    }

    /// Anchor `sub` at `path`. Returns false if it was already there.
    pub fn add(&mut self, path: &[String], sub: SubscriptionRef) -> bool {
        if self.node(path).is_some_and(|n| n.subs.contains(&sub)) {
            return false;
        }
        let mut node = &mut self.root;
        for token in path {
            node.num_child_subs += 1;
            node = node.children.entry(token.clone()).or_default();
        }
        node.subs.push(sub);
        true
    }

    fn add_marker(&mut self, path: &[String], marker: PendingMarker) -> bool {
        if self
            .node(path)
            .is_some_and(|n| n.markers.iter().any(|m| m.same_as(&marker)))
        {
            return false;
        }
        let mut node = &mut self.root;
        for token in path {
            node.num_child_markers += 1;
            node = node.children.entry(token.clone()).or_default();
        }
        node.markers.push(marker);
        true
    }

    /// Remove `sub` from `path`. Returns false if it was not there.
    pub fn remove(&mut self, path: &[String], sub: &SubscriptionRef) -> bool {
        let (removed, _) = purge_at(&mut self.root, path, &|s| s == sub, &|_| false, false);
        removed > 0
    }

    /// Drop every anchor and marker belonging to subscription `id`.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> usize {
        let (removed, _) = purge_at(&mut self.root, &[], &|s| s.id == id, &|m| m.id == id, true);
        removed
    }

    /// Drop the resolved anchors and derived markers at or below a tree
    /// path that was just deleted. Returns the resolved anchors removed.
    pub fn prune_deleted_path(&mut self, path: &[String]) -> usize {
        let (removed, _) = purge_at(&mut self.root, path, &|s| s.resolved, &|m| !m.anchored, true);
        removed
    }

    /// Subscriptions affected by a change at `path`.
    pub fn find(&self, path: &[String], kinds: LookupKinds) -> Vec<SubscriptionRef> {
        let mut out = Vec::new();
        let mut node = &self.root;
        for token in path {
            if kinds.parents {
                out.extend(node.subs.iter().cloned());
            }
            if node.num_child_subs == 0 {
                return out;
            }
            match node.children.get(token) {
                Some(child) => node = child,
                None => return out,
            }
        }
        if kinds.target {
            out.extend(node.subs.iter().cloned());
        }
        if kinds.children {
            node.collect_descendants(&mut out);
        }
        out
    }

    /// True if a change below `path` could matter to anyone: something is
    /// anchored at an ancestor, or anything at all lives at or below `path`.
    pub fn has_interest(&self, path: &[String]) -> bool {
        let mut node = &self.root;
        for token in path {
            if !node.subs.is_empty() || !node.markers.is_empty() {
                return true;
            }
            match node.children.get(token) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.num_subs_recursive() + node.num_markers_recursive() > 0
    }

    /// Register an extended path. The literal prefix is walked (creating
    /// trie nodes as needed) and a marker is parked at the first
    /// non-literal element. A pattern with no wildcard is anchored directly.
    pub fn incrementally_resolve(&mut self, id: SubscriptionId, key: &str, pattern: Arc<CompiledPath>) {
        let prefix = pattern.literal_prefix();
        if prefix.len() == pattern.len() {
            self.add(
                &prefix,
                SubscriptionRef {
                    id,
                    key: key.to_string(),
                    resolved: false,
                },
            );
            return;
        }
        let elem = prefix.len();
        self.add_marker(
            &prefix,
            PendingMarker {
                id,
                key: key.to_string(),
                pattern,
                elem,
                anchored: true,
            },
        );
    }

    /// A concrete path just appeared in the tree. Markers waiting at its
    /// parent that match its last token either advance to it or, on the
    /// final element, promote a resolved subscription.
    ///
    /// Callers must report the parent of a new subtree before its children.
    pub fn process_added_path(&mut self, path: &[String]) -> Vec<Promotion> {
        self.process_added_path_for(path, None)
    }

    fn process_added_path_for(
        &mut self,
        path: &[String],
        only: Option<(SubscriptionId, &str)>,
    ) -> Vec<Promotion> {
        let Some((last, parent)) = path.split_last() else {
            return Vec::new();
        };
        let hits: Vec<PendingMarker> = match self.node(parent) {
            Some(node) => node
                .markers
                .iter()
                .filter(|m| only.map_or(true, |(id, key)| m.id == id && m.key == key))
                .filter(|m| m.matches(last))
                .cloned()
                .collect(),
            None => return Vec::new(),
        };

        let mut promotions = Vec::new();
        for marker in hits {
            if marker.elem + 1 == marker.pattern.len() {
                let sub = SubscriptionRef {
                    id: marker.id,
                    key: marker.key.clone(),
                    resolved: true,
                };
                if self.add(path, sub) {
                    promotions.push(Promotion {
                        id: marker.id,
                        key: marker.key,
                        path: path.to_vec(),
                    });
                }
            } else {
                self.add_marker(
                    path,
                    PendingMarker {
                        elem: marker.elem + 1,
                        anchored: false,
                        ..marker
                    },
                );
            }
        }
        promotions
    }

    /// Resolve one extended path against paths already present in `tree`.
    pub fn resolve_existing(
        &mut self,
        tree: &Arc<Node>,
        id: SubscriptionId,
        key: &str,
        pattern: &CompiledPath,
        use_id_paths: bool,
    ) -> Vec<Promotion> {
        let mut path = pattern.literal_prefix();
        let start = path.len();
        let mut out = Vec::new();
        if let Ok(node) = crate::visitors::traverse(tree, path.as_slice()) {
            self.seed(node, &mut path, pattern, start, (id, key), use_id_paths, &mut out);
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn seed(
        &mut self,
        node: &Arc<Node>,
        path: &mut ConcretePath,
        pattern: &CompiledPath,
        elem: usize,
        only: (SubscriptionId, &str),
        use_id_paths: bool,
        out: &mut Vec<Promotion>,
    ) {
        let Some(matcher) = pattern.elems().get(elem) else {
            return;
        };
        for (token, child) in matching_children(node, matcher, use_id_paths) {
            path.push(token);
            out.extend(self.process_added_path_for(path, Some(only)));
            self.seed(child, path, pattern, elem + 1, only, use_id_paths, out);
            path.pop();
        }
    }

    /// Number of anchored subscriptions, resolved ones included.
    pub fn num_subscriptions(&self) -> usize {
        self.root.num_subs_recursive()
    }

    pub fn num_markers(&self) -> usize {
        self.root.num_markers_recursive()
    }

    /// Number of live trie nodes, the root included.
    pub fn num_path_stores(&self) -> usize {
        self.root.count_nodes()
    }

    /// Subscriptions anchored exactly at `path`.
    pub fn subscriptions_at(&self, path: &[String]) -> Vec<SubscriptionRef> {
        self.node(path).map(|n| n.subs.clone()).unwrap_or_default()
    }
}
