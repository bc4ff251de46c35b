//! Execution context: the restart vehicle of a job or step execution.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

/// Flat, string-keyed map of JSON values scoped to one execution.
///
/// Readers and partitioners store their checkpoint state here. The whole map is
/// persisted on every update, so it must stay small. Any mutation marks the
/// context dirty until [`ExecutionContext::clear_dirty`] is called.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a serializable value under `key`, replacing any previous value.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> DomainResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| DomainError::serialization(format!("context value: {e}")))?;
        self.put_value(key, value);
        Ok(())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    pub fn put_i64(&mut self, key: impl Into<String>, value: i64) {
        self.put_value(key, Value::from(value));
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put_value(key, Value::String(value.into()));
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> DomainResult<Option<T>> {
        self.entries
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| DomainError::serialization(format!("context key '{key}': {e}")))
            })
            .transpose()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Copy every entry of `other` into this context.
    pub fn merge(&mut self, other: &ExecutionContext) {
        for (key, value) in &other.entries {
            self.put_value(key.clone(), value.clone());
        }
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

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Serialize the whole map as a JSON object.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(&self.entries)
            .map_err(|e| DomainError::serialization(format!("execution context: {e}")))
    }

    pub fn from_json(json: &str) -> DomainResult<Self> {
        let entries: BTreeMap<String, Value> = serde_json::from_str(json)
            .map_err(|e| DomainError::serialization(format!("execution context: {e}")))?;
        Ok(Self {
            entries,
            dirty: false,
        })
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
