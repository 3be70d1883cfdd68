// SPDX-License-Identifier: MIT

//! State schema definitions

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Schema defining the workflow state structure
///
/// Fields keep their declaration order; the order is also the order of
/// [`StateSchema::field_names`] and of keys in a state's JSON form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSchema {
    fields: Vec<(String, StateFieldDef)>,
}

/// Definition of a single state field
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateFieldDef {
    /// Type of the field
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Reducer for merging values
    #[serde(default)]
    pub reducer: ReducerType,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

/// Reducer types for merging values into state
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReducerType {
    /// Replace the value (default)
    #[default]
    Overwrite,
    /// Concatenate onto the existing array
    Append,
}

impl FieldType {
    /// Whether `value` is an acceptable value for this type. `null` always is.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    /// The type name of a JSON value, in the same vocabulary
    pub fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl StateFieldDef {
    pub fn new(field_type: FieldType, reducer: ReducerType) -> Self {
        Self {
            field_type,
            reducer,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Initial value for a fresh state, if any
    pub(crate) fn initial_value(&self) -> Option<Value> {
        match (&self.default, self.reducer) {
            (Some(default), _) => Some(default.clone()),
            (None, ReducerType::Append) => Some(Value::Array(vec![])),
            (None, ReducerType::Overwrite) => None,
        }
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing an earlier definition of the same name in place
    pub fn field(mut self, name: impl Into<String>, def: StateFieldDef) -> Self {
        self.insert(name.into(), def);
        self
    }

    /// Shorthand for an `overwrite` field
    pub fn overwrite(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(name, StateFieldDef::new(field_type, ReducerType::Overwrite))
    }

    /// Shorthand for an `append` array field
    pub fn append(self, name: impl Into<String>) -> Self {
        self.field(name, StateFieldDef::new(FieldType::Array, ReducerType::Append))
    }

    fn insert(&mut self, name: String, def: StateFieldDef) {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = def,
            None => self.fields.push((name, def)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StateFieldDef> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, def)| def)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateFieldDef)> {
        self.fields.iter().map(|(n, d)| (n.as_str(), d))
    }
}

impl Serialize for StateSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, def) in &self.fields {
            map.serialize_entry(name, def)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StateSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = StateSchema;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of field names to field definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StateSchema, A::Error> {
                let mut schema = StateSchema::new();
                while let Some((name, def)) = access.next_entry::<String, StateFieldDef>()? {
                    if schema.contains(&name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate state field '{}'",
                            name
                        )));
                    }
                    schema.insert(name, def);
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}
