//! Lazily-deserializing view over a job's serialized arguments.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::ArgumentConversionError;

/// Immutable map of argument name → JSON-serialized value.
///
/// Nothing is decoded up front: each typed read deserializes the raw string on
/// demand, so a job only pays for (and only fails on) the arguments it reads.
/// Equality and hashing are defined over the raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArguments {
    values: BTreeMap<String, String>,
}

macro_rules! typed_accessors {
    ($($get:ident, $get_or:ident => $t:ty;)*) => {
        $(
            pub fn $get(&self, key: &str) -> Result<Option<$t>, ArgumentConversionError> {
                self.get_as::<$t>(key)
            }

            pub fn $get_or(&self, key: &str, default: $t) -> Result<$t, ArgumentConversionError> {
                self.get_as_or::<$t>(key, default)
            }
        )*
    };
}

impl JobArguments {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Read-only view of the raw serialized values.
    pub fn as_serialized_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn get_serialized_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Deserialize the value stored under `key`.
    ///
    /// Returns `Ok(None)` without decoding anything when the key is absent.
    pub fn get_as<T>(&self, key: &str) -> Result<Option<T>, ArgumentConversionError>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.values.get(key) else {
            return Ok(None);
        };

        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| ArgumentConversionError::new(key, std::any::type_name::<T>(), e))
    }

    /// Like [`get_as`](Self::get_as), falling back to `default` for an absent key.
    pub fn get_as_or<T>(&self, key: &str, default: T) -> Result<T, ArgumentConversionError>
    where
        T: DeserializeOwned,
    {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    typed_accessors! {
        get_as_bool, get_as_bool_or => bool;
        get_as_i32, get_as_i32_or => i32;
        get_as_i64, get_as_i64_or => i64;
        get_as_f32, get_as_f32_or => f32;
        get_as_f64, get_as_f64_or => f64;
        get_as_string, get_as_string_or => String;
    }
}

impl From<BTreeMap<String, String>> for JobArguments {
    fn from(values: BTreeMap<String, String>) -> Self {
        Self::new(values)
    }
}
