// SPDX-License-Identifier: MIT

//! Runtime state storage and the per-field merge rules

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::schema::{FieldType, ReducerType, StateSchema};
use crate::error::{GraphError, Result};

/// A partial update returned by a node: field name to new value.
///
/// Keys keep insertion order so merges are applied in the order the node
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    entries: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a key; a repeated key replaces the earlier value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build an update from a JSON object
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(map.into()),
            other => Err(GraphError::type_mismatch(
                "<update>",
                "object",
                FieldType::name_of(&other),
            )),
        }
    }
}

impl From<Map<String, Value>> for Update {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            entries: map.into_iter().collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Update {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut update = Update::new();
        for (k, v) in iter {
            update.insert(k, v);
        }
        update
    }
}

/// Runtime workflow state with reducer support
///
/// A state is bound to the schema it was created from; every mutation goes
/// through [`WorkflowState::apply`], which enforces that schema.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    schema: Arc<StateSchema>,
    fields: HashMap<String, Value>,
}

impl WorkflowState {
    /// Create a new WorkflowState populated with the schema's defaults
    pub fn new(schema: Arc<StateSchema>) -> Self {
        let fields = schema
            .iter()
            .filter_map(|(name, def)| def.initial_value().map(|v| (name.to_string(), v)))
            .collect();

        Self { schema, fields }
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    /// Merge a partial update using each field's reducer.
    ///
    /// The whole update is checked before anything is written, so a failing
    /// update leaves the state as it was.
    pub fn apply(&mut self, update: &Update) -> Result<()> {
        let mut staged = Vec::with_capacity(update.len());
        for (key, value) in update.iter() {
            staged.push((key, self.reduce(key, value)?));
        }
        for (key, value) in staged {
            self.fields.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Write each key of `update` verbatim, ignoring reducers.
    ///
    /// Used to lay a fan-out payload over a branch's copy of the state; keys
    /// and types are still checked against the schema.
    pub fn overlay(&mut self, update: &Update) -> Result<()> {
        for (key, value) in update.iter() {
            let def = self
                .schema
                .get(key)
                .ok_or_else(|| GraphError::UnknownField(key.to_string()))?;
            check_type(key, def.field_type, value)?;
        }
        for (key, value) in update.iter() {
            self.fields.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    /// Compute the merged value for one key without writing it
    fn reduce(&self, key: &str, value: &Value) -> Result<Value> {
        let def = self
            .schema
            .get(key)
            .ok_or_else(|| GraphError::UnknownField(key.to_string()))?;

        match def.reducer {
            ReducerType::Overwrite => {
                check_type(key, def.field_type, value)?;
                Ok(value.clone())
            }
            ReducerType::Append => {
                let new_items = value.as_array().ok_or_else(|| {
                    GraphError::type_mismatch(key, "array", FieldType::name_of(value))
                })?;
                let mut merged = match self.fields.get(key) {
                    None => vec![],
                    Some(Value::Array(current)) => current.clone(),
                    Some(other) => {
                        return Err(GraphError::type_mismatch(
                            key,
                            "array",
                            FieldType::name_of(other),
                        ))
                    }
                };
                merged.extend(new_items.iter().cloned());
                Ok(Value::Array(merged))
            }
        }
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Deserialize a field into `T`; `None` if absent or of another shape
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a nested field value using dot notation (e.g., "result.intent")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    /// Convert state to a JSON object, keys in schema order
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.schema
                .field_names()
                .filter_map(|name| self.fields.get(name).map(|v| (name.to_string(), v.clone())))
                .collect(),
        )
    }

    /// Names of the fields that currently hold a value, in schema order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schema
            .field_names()
            .filter(|name| self.fields.contains_key(*name))
    }
}

impl PartialEq for WorkflowState {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.schema == other.schema
    }
}

fn check_type(key: &str, field_type: FieldType, value: &Value) -> Result<()> {
    if field_type.accepts(value) {
        Ok(())
    } else {
        Err(GraphError::type_mismatch(
            key,
            field_type.as_str(),
            FieldType::name_of(value),
        ))
    }
}
