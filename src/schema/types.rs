//! Type descriptors for the state tree.

use crate::error::{StoreError, TraverseResult};
use std::fmt;
use std::sync::Arc;

/// An enumeration: names mapped to integer values.
#[derive(Debug, PartialEq, Eq)]
pub struct EnumSchema {
    pub name: String,
    values: Vec<(String, i64)>,
}

impl EnumSchema {
    pub fn new<S: Into<String>>(name: impl Into<String>, values: Vec<(S, i64)>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            values: values.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        })
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }

    /// Accepts either the name or the integer value of a member.
    pub fn parse(&self, token: &str) -> Option<i64> {
        if let Some(v) = self.value_of(token) {
            return Some(v);
        }
        let v: i64 = token.parse().ok()?;
        self.name_of(v).map(|_| v)
    }

    pub fn first_value(&self) -> i64 {
        self.values.first().map(|(_, v)| *v).unwrap_or(0)
    }
}

/// Leaf value kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimitiveKind {
    Bool,
    Integer,
    Float,
    String,
    Enum(Arc<EnumSchema>),
}

/// A map key or set member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{}", b),
            Key::Int(i) => write!(f, "{}", i),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl PrimitiveKind {
    /// Parse a path token as a key of this kind. Floats are never keys.
    pub fn parse_key(&self, token: &str) -> Option<Key> {
        match self {
            PrimitiveKind::Bool => match token {
                "true" => Some(Key::Bool(true)),
                "false" => Some(Key::Bool(false)),
                _ => None,
            },
            PrimitiveKind::Integer => token.parse().ok().map(Key::Int),
            PrimitiveKind::Float => None,
            PrimitiveKind::String => Some(Key::Str(token.to_string())),
            PrimitiveKind::Enum(e) => e.parse(token).map(Key::Int),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Integer => "integer",
            PrimitiveKind::Float => "float",
            PrimitiveKind::String => "string",
            PrimitiveKind::Enum(e) => &e.name,
        }
    }
}

/// One member of a struct or variant.
#[derive(Debug)]
pub struct FieldSchema {
    pub id: u16,
    pub name: String,
    pub ty: TypeDesc,
    pub optional: bool,
}

/// A struct or variant (union) description.
///
/// Members are found either by name or by their numeric id.
#[derive(Debug)]
pub struct StructSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

/// Variants share the struct layout; every case is implicitly optional.
pub type VariantSchema = StructSchema;

impl StructSchema {
    pub fn builder(name: impl Into<String>) -> StructSchemaBuilder {
        StructSchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Index of the member named `token`, or whose id is `token`.
    pub fn field_index(&self, token: &str) -> Option<usize> {
        if let Some(i) = self.fields.iter().position(|f| f.name == token) {
            return Some(i);
        }
        let id: u16 = token.parse().ok()?;
        self.fields.iter().position(|f| f.id == id)
    }

    pub fn field_index_by_id(&self, id: u16) -> Option<usize> {
        self.fields.iter().position(|f| f.id == id)
    }

    /// Output token for member `idx`.
    pub fn field_token(&self, idx: usize, use_id: bool) -> String {
        let field = &self.fields[idx];
        if use_id {
            field.id.to_string()
        } else {
            field.name.clone()
        }
    }
}

pub struct StructSchemaBuilder {
    name: String,
    fields: Vec<FieldSchema>,
}

impl StructSchemaBuilder {
    pub fn field(mut self, id: u16, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.fields.push(FieldSchema {
            id,
            name: name.into(),
            ty,
            optional: false,
        });
        self
    }

    pub fn optional(mut self, id: u16, name: impl Into<String>, ty: TypeDesc) -> Self {
        self.fields.push(FieldSchema {
            id,
            name: name.into(),
            ty,
            optional: true,
        });
        self
    }

    pub fn build(self) -> Arc<StructSchema> {
        Arc::new(StructSchema {
            name: self.name,
            fields: self.fields,
        })
    }

    /// Build as a variant. All cases become optional.
    pub fn build_variant(mut self) -> Arc<VariantSchema> {
        for f in &mut self.fields {
            f.optional = true;
        }
        self.build()
    }
}

/// Shape of a node in the tree.
#[derive(Clone, Debug)]
pub enum TypeDesc {
    Primitive(PrimitiveKind),
    Struct(Arc<StructSchema>),
    Variant(Arc<VariantSchema>),
    List(Arc<TypeDesc>),
    Set(PrimitiveKind),
    Map(PrimitiveKind, Arc<TypeDesc>),
}

impl TypeDesc {
    pub fn bool() -> Self {
        TypeDesc::Primitive(PrimitiveKind::Bool)
    }

    pub fn integer() -> Self {
        TypeDesc::Primitive(PrimitiveKind::Integer)
    }

    pub fn float() -> Self {
        TypeDesc::Primitive(PrimitiveKind::Float)
    }

    pub fn string() -> Self {
        TypeDesc::Primitive(PrimitiveKind::String)
    }

    pub fn enumeration(schema: Arc<EnumSchema>) -> Self {
        TypeDesc::Primitive(PrimitiveKind::Enum(schema))
    }

    pub fn list(elem: TypeDesc) -> Self {
        TypeDesc::List(Arc::new(elem))
    }

    pub fn set(kind: PrimitiveKind) -> Self {
        TypeDesc::Set(kind)
    }

    pub fn map(key: PrimitiveKind, value: TypeDesc) -> Self {
        TypeDesc::Map(key, Arc::new(value))
    }

    pub fn structure(schema: Arc<StructSchema>) -> Self {
        TypeDesc::Struct(schema)
    }

    pub fn variant(schema: Arc<VariantSchema>) -> Self {
        TypeDesc::Variant(schema)
    }

    /// Resolve the type of one child hop.
    pub fn child(&self, token: &str) -> Result<TypeDesc, TraverseResult> {
        match self {
            TypeDesc::Primitive(_) => Err(TraverseResult::NonExistentNode),
            TypeDesc::Struct(schema) => schema
                .field_index(token)
                .map(|i| schema.fields[i].ty.clone())
                .ok_or(TraverseResult::InvalidStructMember),
            TypeDesc::Variant(schema) => schema
                .field_index(token)
                .map(|i| schema.fields[i].ty.clone())
                .ok_or(TraverseResult::InvalidVariantMember),
            TypeDesc::List(elem) => token
                .parse::<usize>()
                .map(|_| (**elem).clone())
                .map_err(|_| TraverseResult::InvalidArrayIndex),
            TypeDesc::Set(kind) => kind
                .parse_key(token)
                .map(|_| TypeDesc::Primitive(kind.clone()))
                .ok_or(TraverseResult::InvalidSetMember),
            TypeDesc::Map(key, value) => key
                .parse_key(token)
                .map(|_| (**value).clone())
                .ok_or(TraverseResult::InvalidMapKey),
        }
    }

    /// Resolve the type at `path`, checking each hop against the schema only.
    ///
    /// Succeeding here means a creating write along `path` cannot fail on a
    /// structural hop, except a list index more than one past the end.
    pub fn resolve<S: AsRef<str>>(&self, path: &[S]) -> crate::error::Result<TypeDesc> {
        let mut ty = self.clone();
        for (depth, token) in path.iter().enumerate() {
            ty = ty
                .child(token.as_ref())
                .map_err(|reason| StoreError::invalid_path(path, depth, reason))?;
        }
        Ok(ty)
    }

    /// Rewrite `token` into its canonical form: member names (or ids when
    /// `use_id` is set) and numeric enum keys.
    pub fn canonical_token(&self, token: &str, use_id: bool) -> Option<String> {
        match self {
            TypeDesc::Struct(schema) | TypeDesc::Variant(schema) => schema
                .field_index(token)
                .map(|i| schema.field_token(i, use_id)),
            TypeDesc::Map(kind, _) | TypeDesc::Set(kind) => {
                kind.parse_key(token).map(|k| k.to_string())
            }
            TypeDesc::List(_) => token.parse::<usize>().ok().map(|i| i.to_string()),
            TypeDesc::Primitive(_) => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            TypeDesc::Primitive(kind) => kind.type_name().to_string(),
            TypeDesc::Struct(s) | TypeDesc::Variant(s) => s.name.clone(),
            TypeDesc::List(elem) => format!("list<{}>", elem.type_name()),
            TypeDesc::Set(kind) => format!("set<{}>", kind.type_name()),
            TypeDesc::Map(k, v) => format!("map<{}, {}>", k.type_name(), v.type_name()),
        }
    }
}
