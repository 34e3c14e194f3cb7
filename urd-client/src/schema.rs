//! Request and response schemas advertised by service discovery
//!
//! On the wire a schema is a JSON object mapping field names to type tags,
//! where `optional<T>` marks an optional field. Tags are parsed once into
//! [`FieldType`] and kept in declaration order.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const OPTIONAL_PREFIX: &str = "optional<";

/// Type of a single schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Required(String),
    Optional(String),
}

impl FieldType {
    /// Parse a wire type tag such as `string` or `optional<u32>`.
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim();
        match tag.strip_prefix(OPTIONAL_PREFIX) {
            Some(inner) => {
                let inner = inner.strip_suffix('>').unwrap_or(inner);
                FieldType::Optional(inner.trim().to_string())
            }
            None => FieldType::Required(tag.to_string()),
        }
    }

    /// True for `optional<...>` tags.
    pub fn is_optional(&self) -> bool {
        matches!(self, FieldType::Optional(_))
    }

    /// The underlying type tag without the optional wrapper.
    pub fn type_name(&self) -> &str {
        match self {
            FieldType::Required(t) | FieldType::Optional(t) => t,
        }
    }

    /// The tag as it appears on the wire.
    pub fn to_tag(&self) -> String {
        match self {
            FieldType::Required(t) => t.clone(),
            FieldType::Optional(t) => format!("{}{}>", OPTIONAL_PREFIX, t),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_tag())
    }
}

/// Ordered field name → type mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; a repeated name replaces the earlier type in place.
    pub fn with_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.insert(name.into(), ty);
        self
    }

    fn insert(&mut self, name: String, ty: FieldType) {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = ty,
            None => self.fields.push((name, ty)),
        }
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Type of `name`, if declared.
    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Whether `name` is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Field names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Required field names, in declaration order.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, t)| !t.is_optional()).map(|(n, _)| n)
    }

    /// Optional field names, in declaration order.
    pub fn optional(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, t)| t.is_optional()).map(|(n, _)| n)
    }

    /// Wire representation, preserving field order.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(n, t)| (n.clone(), serde_json::Value::String(t.to_tag())))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // serde_json's preserve_order keeps the object in wire order
        let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut schema = Schema::new();
        for (name, tag) in map {
            let tag = tag.as_str().ok_or_else(|| {
                serde::de::Error::custom(format!("type tag for '{}' must be a string", name))
            })?;
            schema.insert(name, FieldType::parse(tag));
        }
        Ok(schema)
    }
}

impl<N: Into<String>> FromIterator<(N, FieldType)> for Schema {
    fn from_iter<I: IntoIterator<Item = (N, FieldType)>>(iter: I) -> Self {
        let mut schema = Schema::new();
        for (name, ty) in iter {
            schema.insert(name.into(), ty);
        }
        schema
    }
}
