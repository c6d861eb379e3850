//! MetadataMap: keyed JSON state slices.
//!
//! Values are stored untyped and validated on read by deserializing into the
//! caller's type. A stored value that no longer fits is replaced by the
//! default instead of failing the read.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ContainerError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap {
    values: BTreeMap<String, Value>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed value for `key`, initializing it with `default` when missing or
    /// when the stored value does not deserialize into `T`.
    pub fn get_or_insert_with<T>(
        &mut self,
        key: &str,
        default: impl FnOnce() -> Result<T, ContainerError>,
    ) -> Result<T, ContainerError>
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(stored) = self.values.get(key) {
            match T::deserialize(stored) {
                Ok(value) => return Ok(value),
                Err(e) => debug!(key, "replacing invalid stored state: {e}"),
            }
        }

        let value = default()?;
        self.values.insert(key.to_owned(), serde_json::to_value(&value)?);
        Ok(value)
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), ContainerError> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
