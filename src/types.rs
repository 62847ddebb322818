//! Core wire types: paths, protocols, deltas and patches.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A literal path: ordered tokens from the root.
pub type ConcretePath = Vec<String>;

/// Convert any token slice into an owned path.
pub fn to_path<S: AsRef<str>>(path: &[S]) -> ConcretePath {
    path.iter().map(|t| t.as_ref().to_string()).collect()
}

/// Encoding used for values crossing the store boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Json,
    MsgPack,
}

impl Protocol {
    /// Encode a canonical JSON value.
    pub fn encode_value(self, value: &serde_json::Value) -> Result<Vec<u8>> {
        self.encode(value)
    }

    /// Decode bytes into a canonical JSON value.
    pub fn decode_value(self, bytes: &[u8]) -> Result<serde_json::Value> {
        self.decode(bytes)
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Protocol::Json => Ok(serde_json::to_vec(value)?),
            Protocol::MsgPack => Ok(rmp_serde::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Protocol::Json => serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            Protocol::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// One element of an extended path.
///
/// On the wire this is `{"raw": token}`, `{"regex": pattern}` or `{"any": true}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathElemWire", into = "PathElemWire")]
pub enum PathElem {
    Raw(String),
    Regex(String),
    Any,
}

#[derive(Default, Serialize, Deserialize)]
struct PathElemWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    any: Option<bool>,
}

impl TryFrom<PathElemWire> for PathElem {
    type Error = String;

    fn try_from(wire: PathElemWire) -> std::result::Result<Self, Self::Error> {
        match (wire.raw, wire.regex, wire.any) {
            (Some(raw), None, None) => Ok(PathElem::Raw(raw)),
            (None, Some(regex), None) => Ok(PathElem::Regex(regex)),
            (None, None, Some(true)) => Ok(PathElem::Any),
            _ => Err("path element must set exactly one of raw, regex or any".to_string()),
        }
    }
}

impl From<PathElem> for PathElemWire {
    fn from(elem: PathElem) -> Self {
        match elem {
            PathElem::Raw(raw) => PathElemWire {
                raw: Some(raw),
                ..Default::default()
            },
            PathElem::Regex(regex) => PathElemWire {
                regex: Some(regex),
                ..Default::default()
            },
            PathElem::Any => PathElemWire {
                any: Some(true),
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElem::Raw(raw) => f.write_str(raw),
            PathElem::Regex(regex) => write!(f, "~{}", regex),
            PathElem::Any => f.write_str("*"),
        }
    }
}

/// A path pattern that may contain regex or wildcard segments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtendedPath(pub Vec<PathElem>);

impl ExtendedPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn raw(mut self, token: impl Into<String>) -> Self {
        self.0.push(PathElem::Raw(token.into()));
        self
    }

    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.0.push(PathElem::Regex(pattern.into()));
        self
    }

    pub fn any(mut self) -> Self {
        self.0.push(PathElem::Any);
        self
    }

    pub fn elems(&self) -> &[PathElem] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of leading raw elements.
    pub fn literal_prefix_len(&self) -> usize {
        self.0
            .iter()
            .take_while(|e| matches!(e, PathElem::Raw(_)))
            .count()
    }

    /// True if every element is raw, i.e. the pattern names one path.
    pub fn is_concrete(&self) -> bool {
        self.literal_prefix_len() == self.0.len()
    }
}

impl<S: AsRef<str>> From<&[S]> for ExtendedPath {
    fn from(path: &[S]) -> Self {
        Self(
            path.iter()
                .map(|t| PathElem::Raw(t.as_ref().to_string()))
                .collect(),
        )
    }
}

impl fmt::Display for ExtendedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "/{}", parts.join("/"))
    }
}

/// One `(path, old, new)` change. `new` absent means delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaUnit {
    pub path: ConcretePath,
    #[serde(default)]
    pub old: Option<Vec<u8>>,
    #[serde(default)]
    pub new: Option<Vec<u8>>,
}

impl DeltaUnit {
    pub fn set<S: AsRef<str>>(path: &[S], new: Vec<u8>) -> Self {
        Self {
            path: to_path(path),
            old: None,
            new: Some(new),
        }
    }

    pub fn delete<S: AsRef<str>>(path: &[S]) -> Self {
        Self {
            path: to_path(path),
            old: None,
            new: None,
        }
    }
}

/// An ordered list of change units, all encoded with one protocol.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub changes: Vec<DeltaUnit>,
    pub protocol: Protocol,
}

/// A replacement leaf inside a patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValuePatch {
    pub value: Vec<u8>,
    pub protocol: Protocol,
}

/// A patch aimed at one variant case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantPatch {
    pub case_id: u16,
    pub patch: Box<PatchNode>,
}

/// A structural diff shaped like the subtree it targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchNode {
    Value(ValuePatch),
    StructFields(BTreeMap<u16, PatchNode>),
    Entries(BTreeMap<String, PatchNode>),
    Variant(VariantPatch),
    Delete,
}

impl PatchNode {
    /// Encode `value` as a replacement leaf.
    pub fn value<T: Serialize + ?Sized>(value: &T, protocol: Protocol) -> Result<Self> {
        Ok(PatchNode::Value(ValuePatch {
            value: protocol.encode(value)?,
            protocol,
        }))
    }

    /// True for a patch that changes nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            PatchNode::StructFields(fields) => fields.is_empty(),
            PatchNode::Entries(entries) => entries.is_empty(),
            _ => false,
        }
    }
}

/// A patch anchored at `base_path`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub base_path: ConcretePath,
    pub patch: PatchNode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_elem_wire_format() {
        let path = ExtendedPath::new().raw("a").regex("test.*").any();
        let encoded = serde_json::to_value(&path).unwrap();
        assert_eq!(
            encoded,
            json!([{"raw": "a"}, {"regex": "test.*"}, {"any": true}])
        );

        let decoded: ExtendedPath = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, path);
    }

    #[test]
    fn test_path_elem_rejects_ambiguous_elements() {
        let bad = json!([{"raw": "a", "regex": "b"}]);
        assert!(serde_json::from_value::<ExtendedPath>(bad).is_err());

        let bad = json!([{"any": false}]);
        assert!(serde_json::from_value::<ExtendedPath>(bad).is_err());
    }

    #[test]
    fn test_literal_prefix() {
        let path = ExtendedPath::new().raw("a").raw("b").regex("x").raw("d");
        assert_eq!(path.literal_prefix_len(), 2);
        assert!(!path.is_concrete());
        assert!(ExtendedPath::from(&["a", "b"][..]).is_concrete());
        assert_eq!(path.to_string(), "/a/b/~x/d");
    }

    #[test]
    fn test_protocols_agree_on_values() {
        let value = json!({"a": 1, "b": [true, "x"], "c": 2.5});
        for protocol in [Protocol::Json, Protocol::MsgPack] {
            let bytes = protocol.encode_value(&value).unwrap();
            assert_eq!(protocol.decode_value(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_patch_wire_shape() {
        let mut fields = BTreeMap::new();
        fields.insert(1, PatchNode::Delete);
        let patch = Patch {
            base_path: vec!["a".to_string()],
            patch: PatchNode::StructFields(fields),
        };
        let encoded = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            encoded,
            json!({"basePath": ["a"], "patch": {"structFields": {"1": "delete"}}})
        );
    }
}
