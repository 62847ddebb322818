//! The node tree.

use crate::error::{Result, StoreError, TraverseResult};
use crate::schema::{Key, PrimitiveKind, StructSchema, TypeDesc, VariantSchema};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A leaf value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Set members and map keys are values with a total order.
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Value::Bool(b) => Some(Key::Bool(*b)),
            Value::Int(i) => Some(Key::Int(*i)),
            Value::Str(s) => Some(Key::Str(s.clone())),
            Value::Float(_) => None,
        }
    }

    pub fn from_key(key: &Key) -> Self {
        match key {
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// A schema-typed tree node.
///
/// Children are held behind `Arc`. A child whose `Arc` is shared belongs to
/// at least one published root and is never mutated in place; writers go
/// through [`Arc::make_mut`], which clones it first. A child held by exactly
/// one owner is private to the writer and is mutated directly.
#[derive(Clone, Debug)]
pub enum Node {
    Primitive {
        kind: PrimitiveKind,
        value: Value,
    },
    Struct {
        schema: Arc<StructSchema>,
        fields: Vec<Option<Arc<Node>>>,
    },
    Variant {
        schema: Arc<VariantSchema>,
        active: Option<(usize, Arc<Node>)>,
    },
    List {
        elem: Arc<TypeDesc>,
        items: Vec<Arc<Node>>,
    },
    Map {
        key: PrimitiveKind,
        value: Arc<TypeDesc>,
        entries: BTreeMap<Key, Arc<Node>>,
    },
    Set {
        kind: PrimitiveKind,
        members: BTreeMap<Key, Arc<Node>>,
    },
}

impl Node {
    /// Default-construct a node of type `ty`. Required struct members are
    /// populated recursively; optional ones start unset.
    pub fn new(ty: &TypeDesc) -> Node {
        match ty {
            TypeDesc::Primitive(kind) => Node::Primitive {
                kind: kind.clone(),
                value: default_value(kind),
            },
            TypeDesc::Struct(schema) => Node::Struct {
                schema: schema.clone(),
                fields: schema
                    .fields
                    .iter()
                    .map(|f| (!f.optional).then(|| Arc::new(Node::new(&f.ty))))
                    .collect(),
            },
            TypeDesc::Variant(schema) => Node::Variant {
                schema: schema.clone(),
                active: None,
            },
            TypeDesc::List(elem) => Node::List {
                elem: elem.clone(),
                items: Vec::new(),
            },
            TypeDesc::Set(kind) => Node::Set {
                kind: kind.clone(),
                members: BTreeMap::new(),
            },
            TypeDesc::Map(key, value) => Node::Map {
                key: key.clone(),
                value: value.clone(),
                entries: BTreeMap::new(),
            },
        }
    }

    pub fn primitive(kind: PrimitiveKind, value: Value) -> Node {
        Node::Primitive { kind, value }
    }

    pub fn type_desc(&self) -> TypeDesc {
        match self {
            Node::Primitive { kind, .. } => TypeDesc::Primitive(kind.clone()),
            Node::Struct { schema, .. } => TypeDesc::Struct(schema.clone()),
            Node::Variant { schema, .. } => TypeDesc::Variant(schema.clone()),
            Node::List { elem, .. } => TypeDesc::List(elem.clone()),
            Node::Set { kind, .. } => TypeDesc::Set(kind.clone()),
            Node::Map { key, value, .. } => TypeDesc::Map(key.clone(), value.clone()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Primitive { .. } => "primitive",
            Node::Struct { .. } => "struct",
            Node::Variant { .. } => "variant",
            Node::List { .. } => "list",
            Node::Set { .. } => "set",
            Node::Map { .. } => "map",
        }
    }

    /// True if both nodes are the same container kind over the same schema,
    /// so their children can be paired up.
    pub fn same_shape(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Struct { schema: a, .. }, Node::Struct { schema: b, .. }) => Arc::ptr_eq(a, b),
            (Node::Variant { schema: a, .. }, Node::Variant { schema: b, .. }) => Arc::ptr_eq(a, b),
            (Node::List { .. }, Node::List { .. })
            | (Node::Set { .. }, Node::Set { .. })
            | (Node::Map { .. }, Node::Map { .. }) => true,
            _ => false,
        }
    }

    /// Primitive payload, if this is a leaf.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Node::Primitive { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Resolve one hop for reading.
    pub fn child(&self, token: &str) -> std::result::Result<&Arc<Node>, TraverseResult> {
        match self {
            Node::Primitive { .. } => Err(TraverseResult::NonExistentNode),
            Node::Struct { schema, fields } => {
                let idx = schema
                    .field_index(token)
                    .ok_or(TraverseResult::InvalidStructMember)?;
                fields[idx].as_ref().ok_or(TraverseResult::NonExistentNode)
            }
            Node::Variant { schema, active } => {
                let idx = schema
                    .field_index(token)
                    .ok_or(TraverseResult::InvalidVariantMember)?;
                match active {
                    Some((a, node)) if *a == idx => Ok(node),
                    _ => Err(TraverseResult::IncorrectVariantMember),
                }
            }
            Node::List { items, .. } => {
                let idx: usize = token
                    .parse()
                    .map_err(|_| TraverseResult::InvalidArrayIndex)?;
                items.get(idx).ok_or(TraverseResult::InvalidArrayIndex)
            }
            Node::Map { key, entries, .. } => {
                let k = key.parse_key(token).ok_or(TraverseResult::InvalidMapKey)?;
                entries.get(&k).ok_or(TraverseResult::NonExistentNode)
            }
            Node::Set { kind, members } => {
                let k = kind.parse_key(token).ok_or(TraverseResult::InvalidSetMember)?;
                members.get(&k).ok_or(TraverseResult::NonExistentNode)
            }
        }
    }

    /// Resolve one hop for writing. With `create`, missing children are
    /// default-constructed, list indexes past the end grow the list, and a
    /// different variant case is switched to.
    pub fn child_slot(
        &mut self,
        token: &str,
        create: bool,
    ) -> std::result::Result<&mut Arc<Node>, TraverseResult> {
        match self {
            Node::Primitive { .. } => Err(TraverseResult::NonExistentNode),
            Node::Struct { schema, fields } => {
                let idx = schema
                    .field_index(token)
                    .ok_or(TraverseResult::InvalidStructMember)?;
                let slot = &mut fields[idx];
                if slot.is_none() {
                    if !create {
                        return Err(TraverseResult::NonExistentNode);
                    }
                    *slot = Some(Arc::new(Node::new(&schema.fields[idx].ty)));
                }
                slot.as_mut().ok_or(TraverseResult::NonExistentNode)
            }
            Node::Variant { schema, active } => {
                let idx = schema
                    .field_index(token)
                    .ok_or(TraverseResult::InvalidVariantMember)?;
                let is_active = matches!(active, Some((a, _)) if *a == idx);
                if !is_active {
                    if !create {
                        return Err(TraverseResult::IncorrectVariantMember);
                    }
                    *active = None;
                }
                let (_, node) = active
                    .get_or_insert_with(|| (idx, Arc::new(Node::new(&schema.fields[idx].ty))));
                Ok(node)
            }
            Node::List { elem, items } => {
                let idx: usize = token
                    .parse()
                    .map_err(|_| TraverseResult::InvalidArrayIndex)?;
                // Creating may only append one past the end.
                if idx > items.len() || (idx == items.len() && !create) {
                    return Err(TraverseResult::InvalidArrayIndex);
                }
                if idx == items.len() {
                    items.push(Arc::new(Node::new(&**elem)));
                }
                Ok(&mut items[idx])
            }
            Node::Map {
                key,
                value,
                entries,
            } => {
                let k = key.parse_key(token).ok_or(TraverseResult::InvalidMapKey)?;
                if create {
                    Ok(entries
                        .entry(k)
                        .or_insert_with(|| Arc::new(Node::new(&**value))))
                } else {
                    entries.get_mut(&k).ok_or(TraverseResult::NonExistentNode)
                }
            }
            Node::Set { kind, members } => {
                let k = kind.parse_key(token).ok_or(TraverseResult::InvalidSetMember)?;
                if create {
                    let member = Node::primitive(kind.clone(), Value::from_key(&k));
                    Ok(members.entry(k).or_insert_with(|| Arc::new(member)))
                } else {
                    members.get_mut(&k).ok_or(TraverseResult::NonExistentNode)
                }
            }
        }
    }

    /// Remove the child named by the last token of `path`.
    ///
    /// Returns whether anything was removed. Removing a required struct
    /// member is a type error.
    pub(crate) fn remove_child<S: AsRef<str>>(&mut self, path: &[S]) -> Result<bool> {
        let depth = path.len().saturating_sub(1);
        let token = match path.last() {
            Some(t) => t.as_ref(),
            None => return Err(StoreError::InvalidOperation("empty path".to_string())),
        };
        let fail = |reason| StoreError::invalid_path(path, depth, reason);

        match self {
            Node::Primitive { .. } => Err(fail(TraverseResult::NonExistentNode)),
            Node::Struct { schema, fields } => {
                let idx = schema
                    .field_index(token)
                    .ok_or_else(|| fail(TraverseResult::InvalidStructMember))?;
                let field = &schema.fields[idx];
                if !field.optional {
                    return Err(StoreError::TypeError(format!(
                        "cannot remove required member {}.{}",
                        schema.name, field.name
                    )));
                }
                Ok(fields[idx].take().is_some())
            }
            Node::Variant { schema, active } => {
                let idx = schema
                    .field_index(token)
                    .ok_or_else(|| fail(TraverseResult::InvalidVariantMember))?;
                if matches!(active, Some((a, _)) if *a == idx) {
                    *active = None;
                    return Ok(true);
                }
                Ok(false)
            }
            Node::List { items, .. } => {
                let idx: usize = token
                    .parse()
                    .map_err(|_| fail(TraverseResult::InvalidArrayIndex))?;
                if idx < items.len() {
                    items.remove(idx);
                    return Ok(true);
                }
                Ok(false)
            }
            Node::Map { key, entries, .. } => {
                let k = key
                    .parse_key(token)
                    .ok_or_else(|| fail(TraverseResult::InvalidMapKey))?;
                Ok(entries.remove(&k).is_some())
            }
            Node::Set { kind, members } => {
                let k = kind
                    .parse_key(token)
                    .ok_or_else(|| fail(TraverseResult::InvalidSetMember))?;
                Ok(members.remove(&k).is_some())
            }
        }
    }

    /// Present children with their output tokens, in schema/key order.
    pub fn children(&self, use_id: bool) -> Vec<(String, &Arc<Node>)> {
        match self {
            Node::Primitive { .. } => Vec::new(),
            Node::Struct { schema, fields } => fields
                .iter()
                .enumerate()
                .filter_map(|(i, f)| f.as_ref().map(|n| (schema.field_token(i, use_id), n)))
                .collect(),
            Node::Variant { schema, active } => active
                .iter()
                .map(|(i, n)| (schema.field_token(*i, use_id), n))
                .collect(),
            Node::List { items, .. } => items
                .iter()
                .enumerate()
                .map(|(i, n)| (i.to_string(), n))
                .collect(),
            Node::Map { entries, .. } => entries.iter().map(|(k, n)| (k.to_string(), n)).collect(),
            Node::Set { members, .. } => members.iter().map(|(k, n)| (k.to_string(), n)).collect(),
        }
    }
}

fn default_value(kind: &PrimitiveKind) -> Value {
    match kind {
        PrimitiveKind::Bool => Value::Bool(false),
        PrimitiveKind::Integer => Value::Int(0),
        PrimitiveKind::Float => Value::Float(0.0),
        PrimitiveKind::String => Value::Str(String::new()),
        PrimitiveKind::Enum(e) => Value::Int(e.first_value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<StructSchema> {
        let choice = StructSchema::builder("Choice")
            .field(1, "a", TypeDesc::integer())
            .field(2, "b", TypeDesc::string())
            .build_variant();
        StructSchema::builder("Root")
            .field(1, "tx", TypeDesc::bool())
            .optional(2, "name", TypeDesc::string())
            .field(3, "items", TypeDesc::list(TypeDesc::integer()))
            .field(4, "choice", TypeDesc::variant(choice))
            .field(5, "tags", TypeDesc::set(PrimitiveKind::String))
            .build()
    }

    #[test]
    fn test_default_construction() {
        let node = Node::new(&TypeDesc::structure(schema()));
        assert!(node.child("tx").is_ok());
        assert_eq!(node.child("name").unwrap_err(), TraverseResult::NonExistentNode);
        assert_eq!(
            node.child("choice").unwrap().child("a").unwrap_err(),
            TraverseResult::IncorrectVariantMember
        );
        assert_eq!(
            node.child("choice").unwrap().child("zzz").unwrap_err(),
            TraverseResult::InvalidVariantMember
        );
    }

    #[test]
    fn test_child_slot_creates_on_demand() {
        let mut node = Node::new(&TypeDesc::structure(schema()));
        assert!(node.child_slot("name", false).is_err());
        assert!(node.child_slot("name", true).is_ok());
        assert!(node.child("name").is_ok());

        let items = Arc::make_mut(node.child_slot("items", false).unwrap());
        items.child_slot("3", true).unwrap();
        assert_eq!(items.children(false).len(), 4);
    }

    #[test]
    fn test_variant_switches_case_on_create() {
        let mut node = Node::new(&TypeDesc::structure(schema()));
        let choice = Arc::make_mut(node.child_slot("choice", false).unwrap());
        choice.child_slot("a", true).unwrap();
        assert!(choice.child("a").is_ok());
        choice.child_slot("b", true).unwrap();
        assert_eq!(choice.child("a").unwrap_err(), TraverseResult::IncorrectVariantMember);
        assert!(choice.child("b").is_ok());
    }

    #[test]
    fn test_remove_required_member_is_type_error() {
        let mut node = Node::new(&TypeDesc::structure(schema()));
        assert!(matches!(
            node.remove_child(&["tx"]),
            Err(StoreError::TypeError(_))
        ));
        assert_eq!(node.remove_child(&["name"]).unwrap(), false);
    }

    #[test]
    fn test_set_members() {
        let mut node = Node::new(&TypeDesc::set(PrimitiveKind::Integer));
        node.child_slot("5", true).unwrap();
        assert!(node.child("5").is_ok());
        assert_eq!(node.child("x").unwrap_err(), TraverseResult::InvalidSetMember);
        assert_eq!(node.child("6").unwrap_err(), TraverseResult::NonExistentNode);
    }
}
