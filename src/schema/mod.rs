//! Schema descriptions for the state tree.
//!
//! The store does not generate code from an IDL. Instead, a program builds
//! a description of its tree shape once, at startup:
//!
//! ```ignore
//! let port = StructSchema::builder("Port")
//!     .field(1, "name", TypeDesc::string())
//!     .optional(2, "speed", TypeDesc::integer())
//!     .build();
//! let root = StructSchema::builder("SwitchState")
//!     .field(1, "ports", TypeDesc::map(PrimitiveKind::Integer, TypeDesc::structure(port)))
//!     .build();
//! ```
//!
//! Struct members are addressable by name or by numeric id.

mod types;

pub use types::{
    EnumSchema, FieldSchema, Key, PrimitiveKind, StructSchema, StructSchemaBuilder, TypeDesc,
    VariantSchema,
};
