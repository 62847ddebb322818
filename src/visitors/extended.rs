//! Extended path traversal: fan out over every child matching a regex or
//! wildcard segment.

use crate::error::{Result, StoreError};
use crate::nodes::Node;
use crate::types::{ConcretePath, ExtendedPath, PathElem};
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Arc;

const DEFAULT_REGEX_CACHE_SIZE: usize = 256;

/// Compiled regexes keyed by their source pattern.
pub struct RegexCache {
    cache: Mutex<LruCache<String, Regex>>,
}

impl RegexCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compile `pattern` anchored at both ends, reusing a cached copy.
    pub fn get(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.cache.lock().get(pattern).cloned() {
            return Ok(re);
        }
        let re = compile_full_match(pattern)?;
        self.cache.lock().put(pattern.to_string(), re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new(DEFAULT_REGEX_CACHE_SIZE)
    }
}

fn compile_full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| StoreError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// One compiled extended path element.
#[derive(Clone, Debug)]
pub enum ElemMatcher {
    Raw(String),
    Regex(Regex),
    Any,
}

impl ElemMatcher {
    pub fn compile(elem: &PathElem, cache: Option<&RegexCache>) -> Result<Self> {
        Ok(match elem {
            PathElem::Raw(raw) => ElemMatcher::Raw(raw.clone()),
            PathElem::Regex(pattern) => ElemMatcher::Regex(match cache {
                Some(cache) => cache.get(pattern)?,
                None => compile_full_match(pattern)?,
            }),
            PathElem::Any => ElemMatcher::Any,
        })
    }

    /// Does a concrete token satisfy this element?
    pub fn matches(&self, token: &str) -> bool {
        match self {
            ElemMatcher::Raw(raw) => raw == token,
            ElemMatcher::Regex(re) => re.is_match(token),
            ElemMatcher::Any => true,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ElemMatcher::Raw(_))
    }
}

/// A fully compiled extended path.
#[derive(Clone, Debug)]
pub struct CompiledPath {
    elems: Vec<ElemMatcher>,
}

impl CompiledPath {
    pub fn compile(path: &ExtendedPath, cache: Option<&RegexCache>) -> Result<Self> {
        let elems = path
            .elems()
            .iter()
            .map(|e| ElemMatcher::compile(e, cache))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { elems })
    }

    pub fn elems(&self) -> &[ElemMatcher] {
        &self.elems
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Number of leading raw elements.
    pub fn literal_prefix_len(&self) -> usize {
        self.elems.iter().take_while(|e| e.is_raw()).count()
    }

    /// The leading raw elements as a concrete path.
    pub fn literal_prefix(&self) -> ConcretePath {
        self.elems
            .iter()
            .map_while(|e| match e {
                ElemMatcher::Raw(raw) => Some(raw.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Children of `node` selected by `matcher`.
///
/// A raw element is a direct lookup. A regex or wildcard enumerates the
/// present children and tests their string form. Variants only ever match
/// the active case by its raw name.
pub fn matching_children<'a>(
    node: &'a Node,
    matcher: &ElemMatcher,
    use_id: bool,
) -> Vec<(String, &'a Arc<Node>)> {
    match (node, matcher) {
        (Node::Primitive { .. }, _) => Vec::new(),
        (_, ElemMatcher::Raw(raw)) => match node.child(raw) {
            Ok(child) => {
                let token = node
                    .type_desc()
                    .canonical_token(raw, use_id)
                    .unwrap_or_else(|| raw.clone());
                vec![(token, child)]
            }
            Err(_) => Vec::new(),
        },
        (Node::Variant { .. }, _) => Vec::new(),
        (_, matcher) => node
            .children(use_id)
            .into_iter()
            .filter(|(token, _)| matcher.matches(token))
            .collect(),
    }
}

/// Resolve `path` against `root`, calling `f` once per concrete match.
///
/// Cost is proportional to the number of matches.
pub fn visit_extended<F>(root: &Arc<Node>, path: &CompiledPath, use_id: bool, mut f: F)
where
    F: FnMut(&[String], &Arc<Node>),
{
    let mut current = Vec::with_capacity(path.len());
    walk(root, path.elems(), use_id, &mut current, &mut f);
}

fn walk<F>(
    node: &Arc<Node>,
    elems: &[ElemMatcher],
    use_id: bool,
    current: &mut ConcretePath,
    f: &mut F,
) where
    F: FnMut(&[String], &Arc<Node>),
{
    let Some((head, rest)) = elems.split_first() else {
        f(current, node);
        return;
    };
    for (token, child) in matching_children(node, head, use_id) {
        current.push(token);
        walk(child, rest, use_id, current, f);
        current.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PrimitiveKind, StructSchema, TypeDesc};
    use serde_json::json;

    fn tree() -> Arc<Node> {
        let choice = StructSchema::builder("Choice")
            .field(1, "left", TypeDesc::integer())
            .field(2, "right", TypeDesc::integer())
            .build_variant();
        let ty = TypeDesc::structure(
            StructSchema::builder("Root")
                .field(1, "counters", TypeDesc::map(PrimitiveKind::String, TypeDesc::integer()))
                .field(2, "list", TypeDesc::list(TypeDesc::string()))
                .field(3, "choice", TypeDesc::variant(choice))
                .build(),
        );
        let json = json!({
            "counters": {"test1": 1, "test22": 2, "other": 3},
            "list": ["a", "b", "c"],
            "choice": {"right": 4},
        });
        Arc::new(Node::from_json(&ty, &json).unwrap())
    }

    fn collect(root: &Arc<Node>, path: ExtendedPath) -> Vec<(Vec<String>, serde_json::Value)> {
        let compiled = CompiledPath::compile(&path, None).unwrap();
        let mut out = Vec::new();
        visit_extended(root, &compiled, false, |p, n| out.push((p.to_vec(), n.to_json())));
        out
    }

    #[test]
    fn test_regex_matches_full_key() {
        let root = tree();
        let out = collect(&root, ExtendedPath::new().raw("counters").regex("test.*"));
        let paths: Vec<_> = out.iter().map(|(p, _)| p.join("/")).collect();
        assert_eq!(paths, vec!["counters/test1", "counters/test22"]);

        // Regexes are anchored: "test" alone does not match "test1".
        let out = collect(&root, ExtendedPath::new().raw("counters").regex("test"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_any_and_list_indexes() {
        let root = tree();
        assert_eq!(collect(&root, ExtendedPath::new().raw("counters").any()).len(), 3);

        let out = collect(&root, ExtendedPath::new().raw("list").regex("[02]"));
        assert_eq!(
            out,
            vec![
                (vec!["list".to_string(), "0".to_string()], json!("a")),
                (vec!["list".to_string(), "2".to_string()], json!("c")),
            ]
        );
    }

    #[test]
    fn test_variant_only_matches_active_raw_member() {
        let root = tree();
        assert_eq!(collect(&root, ExtendedPath::new().raw("choice").raw("right")).len(), 1);
        assert!(collect(&root, ExtendedPath::new().raw("choice").raw("left")).is_empty());
        assert!(collect(&root, ExtendedPath::new().raw("choice").any()).is_empty());
    }

    #[test]
    fn test_struct_members_by_id() {
        let root = tree();
        let compiled = CompiledPath::compile(&ExtendedPath::new().regex("[12]").any(), None).unwrap();
        let mut paths = Vec::new();
        visit_extended(&root, &compiled, true, |p, _| paths.push(p.join("/")));
        assert_eq!(paths.len(), 6);
        assert!(paths.contains(&"1/other".to_string()));
        assert!(paths.contains(&"2/1".to_string()));
    }

    #[test]
    fn test_invalid_regex_and_cache() {
        let cache = RegexCache::new(2);
        assert!(matches!(
            cache.get("(unclosed"),
            Err(StoreError::InvalidRegex { .. })
        ));
        cache.get("a.*").unwrap();
        cache.get("a.*").unwrap();
        assert_eq!(cache.len(), 1);
    }
}
