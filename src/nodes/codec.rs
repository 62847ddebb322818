//! Conversion between nodes and their canonical JSON form.
//!
//! Structs are objects keyed by member name, variants are single-entry
//! objects, maps are objects keyed by the key's string form, lists and sets
//! are arrays, and enums are integers. Decoding accepts member ids in place
//! of names and enum names in place of integers.

use super::node::{Node, Value};
use crate::error::{Result, StoreError};
use crate::schema::{Key, PrimitiveKind, StructSchema, TypeDesc};
use crate::types::Protocol;
use serde_json::{Map as JsonMap, Number, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

impl Node {
    pub fn to_json(&self) -> Json {
        match self {
            Node::Primitive { value, .. } => value_to_json(value),
            Node::Struct { schema, fields } => {
                let mut obj = JsonMap::new();
                for (i, field) in fields.iter().enumerate() {
                    if let Some(node) = field {
                        obj.insert(schema.fields[i].name.clone(), node.to_json());
                    }
                }
                Json::Object(obj)
            }
            Node::Variant { schema, active } => {
                let mut obj = JsonMap::new();
                if let Some((i, node)) = active {
                    obj.insert(schema.fields[*i].name.clone(), node.to_json());
                }
                Json::Object(obj)
            }
            Node::List { items, .. } => Json::Array(items.iter().map(|n| n.to_json()).collect()),
            Node::Set { members, .. } => {
                Json::Array(members.values().map(|n| n.to_json()).collect())
            }
            Node::Map { entries, .. } => Json::Object(
                entries
                    .iter()
                    .map(|(k, n)| (k.to_string(), n.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a node of type `ty` from JSON.
    ///
    /// Decoding is strict: unknown members and missing required members are
    /// type errors, so a replacement never silently resets fields the
    /// sender did not know about.
    pub fn from_json(ty: &TypeDesc, json: &Json) -> Result<Node> {
        match ty {
            TypeDesc::Primitive(kind) => Ok(Node::Primitive {
                kind: kind.clone(),
                value: value_from_json(kind, json)?,
            }),
            TypeDesc::Struct(schema) => {
                let obj = expect_object(ty, json)?;
                let mut fields: Vec<Option<Arc<Node>>> = vec![None; schema.fields.len()];
                for (name, value) in obj {
                    let idx = member_index(schema, name)?;
                    let field = &schema.fields[idx];
                    if value.is_null() && field.optional {
                        continue;
                    }
                    fields[idx] = Some(Arc::new(Node::from_json(&field.ty, value)?));
                }
                for (field, slot) in schema.fields.iter().zip(&fields) {
                    if !field.optional && slot.is_none() {
                        return Err(StoreError::TypeError(format!(
                            "missing required member {}.{}",
                            schema.name, field.name
                        )));
                    }
                }
                Ok(Node::Struct {
                    schema: schema.clone(),
                    fields,
                })
            }
            TypeDesc::Variant(schema) => {
                let obj = expect_object(ty, json)?;
                let mut active = None;
                for (name, value) in obj {
                    if value.is_null() {
                        continue;
                    }
                    if active.is_some() {
                        return Err(StoreError::TypeError(format!(
                            "variant {} has more than one active case",
                            schema.name
                        )));
                    }
                    let idx = member_index(schema, name)?;
                    let node = Node::from_json(&schema.fields[idx].ty, value)?;
                    active = Some((idx, Arc::new(node)));
                }
                Ok(Node::Variant {
                    schema: schema.clone(),
                    active,
                })
            }
            TypeDesc::List(elem) => {
                let arr = expect_array(ty, json)?;
                let items = arr
                    .iter()
                    .map(|v| Node::from_json(elem, v).map(Arc::new))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::List {
                    elem: elem.clone(),
                    items,
                })
            }
            TypeDesc::Set(kind) => {
                let arr = expect_array(ty, json)?;
                let mut members = BTreeMap::new();
                for v in arr {
                    let value = value_from_json(kind, v)?;
                    let key = value.to_key().ok_or_else(|| {
                        StoreError::TypeError(format!("{} cannot be a set member", kind.type_name()))
                    })?;
                    members.insert(key, Arc::new(Node::primitive(kind.clone(), value)));
                }
                Ok(Node::Set {
                    kind: kind.clone(),
                    members,
                })
            }
            TypeDesc::Map(key_kind, value_ty) => {
                let obj = expect_object(ty, json)?;
                let mut entries = BTreeMap::new();
                for (k, v) in obj {
                    let key = key_kind.parse_key(k).ok_or_else(|| {
                        StoreError::TypeError(format!(
                            "{:?} is not a valid {} key",
                            k,
                            key_kind.type_name()
                        ))
                    })?;
                    entries.insert(key, Arc::new(Node::from_json(value_ty, v)?));
                }
                Ok(Node::Map {
                    key: key_kind.clone(),
                    value: value_ty.clone(),
                    entries,
                })
            }
        }
    }

    pub fn encode(&self, protocol: Protocol) -> Result<Vec<u8>> {
        protocol.encode_value(&self.to_json())
    }

    pub fn decode(ty: &TypeDesc, protocol: Protocol, bytes: &[u8]) -> Result<Node> {
        let json = protocol.decode_value(bytes)?;
        Node::from_json(ty, &json)
    }
}

fn member_index(schema: &StructSchema, token: &str) -> Result<usize> {
    schema.field_index(token).ok_or_else(|| {
        StoreError::TypeError(format!("{} has no member {:?}", schema.name, token))
    })
}

fn expect_object<'a>(ty: &TypeDesc, json: &'a Json) -> Result<&'a JsonMap<String, Json>> {
    json.as_object().ok_or_else(|| mismatch(ty, json))
}

fn expect_array<'a>(ty: &TypeDesc, json: &'a Json) -> Result<&'a Vec<Json>> {
    json.as_array().ok_or_else(|| mismatch(ty, json))
}

fn mismatch(ty: &TypeDesc, json: &Json) -> StoreError {
    StoreError::TypeError(format!("expected {}, got {}", ty.type_name(), json))
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.clone()),
    }
}

fn value_from_json(kind: &PrimitiveKind, json: &Json) -> Result<Value> {
    let value = match kind {
        PrimitiveKind::Bool => json.as_bool().map(Value::Bool),
        PrimitiveKind::Integer => json.as_i64().map(Value::Int),
        PrimitiveKind::Float => json.as_f64().map(Value::Float),
        PrimitiveKind::String => json.as_str().map(|s| Value::Str(s.to_string())),
        PrimitiveKind::Enum(e) => match json {
            Json::Number(n) => n.as_i64().filter(|v| e.name_of(*v).is_some()),
            Json::String(s) => e.value_of(s),
            _ => None,
        }
        .map(Value::Int),
    };
    value.ok_or_else(|| {
        StoreError::TypeError(format!("expected {}, got {}", kind.type_name(), json))
    })
}

/// Parse a key token, used by patch entries on maps and sets.
pub(crate) fn parse_key_token(kind: &PrimitiveKind, token: &str) -> Result<Key> {
    kind.parse_key(token).ok_or_else(|| {
        StoreError::TypeError(format!("{:?} is not a valid {} key", token, kind.type_name()))
    })
}
