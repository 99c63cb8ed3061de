//! Field type tags.

use std::fmt;

/// Type tag of a mapped field, as declared in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    String,
    Boolean,
    DateTime,
    Float,
    /// A value object, named by its type.
    ValueObject(&'static str),
}

impl FieldType {
    /// Parse a type name the way mapping files spell it.
    ///
    /// `int`/`integer` and `bool`/`boolean` are aliases; anything that is not
    /// a scalar name is treated as a value-object type name.
    pub fn parse(name: &'static str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => FieldType::Integer,
            "string" => FieldType::String,
            "bool" | "boolean" => FieldType::Boolean,
            "datetime" => FieldType::DateTime,
            "float" => FieldType::Float,
            _ => FieldType::ValueObject(name),
        }
    }

    /// Canonical name of this type.
    pub const fn name(&self) -> &'static str {
        match self {
            FieldType::Integer => "int",
            FieldType::String => "string",
            FieldType::Boolean => "bool",
            FieldType::DateTime => "datetime",
            FieldType::Float => "float",
            FieldType::ValueObject(name) => name,
        }
    }

    pub const fn is_value_object(&self) -> bool {
        matches!(self, FieldType::ValueObject(_))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared kind of an entity property.
///
/// Entities report this for every property they expose, which lets the
/// factory verify metadata against the entity type without reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// A scalar or value-object property.
    Field(FieldType),
    /// A single-valued association slot.
    Reference,
    /// A collection-valued association slot.
    Collection,
}
