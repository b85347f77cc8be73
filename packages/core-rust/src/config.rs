//! Read-only flat configuration store.
//!
//! Keys are dotted strings (`clients.baz.timeout`) mapped to JSON values.
//! The store is populated once from seed values and never mutated
//! afterwards, so it can be shared across threads behind an `Arc` without
//! locking.
//!
//! Two lookup styles are offered:
//! - `get_*` ("must get"): the key must exist with the requested type,
//!   otherwise a [`ConfigError`] is returned.
//! - `*_or`: returns the supplied default when the key is absent, but still
//!   rejects a present value of the wrong type.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Errors returned by typed configuration lookups.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config key not found: {key}")]
    Missing { key: String },
    #[error("config key {key} has wrong type: expected {expected}, found {found}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("config key {key} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config key {key} is out of range: {value}")]
    OutOfRange { key: String, value: i64 },
    #[error("config document is not a JSON object")]
    NotAnObject,
    #[error("config document could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Immutable flat key/value configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    values: BTreeMap<String, Value>,
}

impl StaticConfig {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from `(key, value)` seed pairs.
    ///
    /// Later pairs override earlier ones with the same key.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Builds a store from a flat JSON object whose keys are full dotted paths.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and
    /// `ConfigError::NotAnObject` when the top-level value is not an object.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    /// Returns a copy of this store with `overrides` layered on top.
    #[must_use]
    pub fn with_overrides<K, I>(&self, overrides: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut values = self.values.clone();
        values.extend(overrides.into_iter().map(|(k, v)| (k.into(), v)));
        Self { values }
    }

    /// Returns `true` if `key` is present (a `null` value counts as present).
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the raw JSON value for `key`.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Iterates over all keys that start with `prefix`.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.values
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_str())
    }

    fn require(&self, key: &str) -> Result<&Value, ConfigError> {
        self.values.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    fn wrong_type(key: &str, expected: &'static str, found: &Value) -> ConfigError {
        ConfigError::WrongType {
            key: key.to_string(),
            expected,
            found: type_name(found),
        }
    }

    /// Looks up a boolean.
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `WrongType` when not a boolean.
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| Self::wrong_type(key, "boolean", value))
    }

    /// Looks up a signed integer.
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `WrongType` when not an integer.
    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| Self::wrong_type(key, "integer", value))
    }

    /// Looks up a floating point number. Integers are widened.
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `WrongType` when not a number.
    pub fn get_float(&self, key: &str) -> Result<f64, ConfigError> {
        let value = self.require(key)?;
        value
            .as_f64()
            .ok_or_else(|| Self::wrong_type(key, "number", value))
    }

    /// Looks up a string.
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `WrongType` when not a string.
    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        let value = self.require(key)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Self::wrong_type(key, "string", value))
    }

    /// Decodes the value at `key` into `T`.
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `Decode` when the value does not fit `T`.
    pub fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.require(key)?;
        serde_json::from_value(value.clone()).map_err(|source| ConfigError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Boolean lookup falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// `WrongType` when present but not a boolean.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        if self.contains_key(key) {
            self.get_bool(key)
        } else {
            Ok(default)
        }
    }

    /// Integer lookup falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// `WrongType` when present but not an integer.
    pub fn int_or(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        if self.contains_key(key) {
            self.get_int(key)
        } else {
            Ok(default)
        }
    }

    /// Float lookup falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// `WrongType` when present but not a number.
    pub fn float_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        if self.contains_key(key) {
            self.get_float(key)
        } else {
            Ok(default)
        }
    }

    /// String lookup falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// `WrongType` when present but not a string.
    pub fn string_or(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        if self.contains_key(key) {
            self.get_string(key)
        } else {
            Ok(default.to_string())
        }
    }

    /// String lookup that returns `None` when the key is absent.
    ///
    /// # Errors
    ///
    /// `WrongType` when present but not a string.
    pub fn optional_string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        if self.contains_key(key) {
            self.get_string(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads a string-to-string map (for example `http.defaultHeaders`).
    /// Absent keys yield an empty map.
    ///
    /// # Errors
    ///
    /// `Decode` when present but not an object of strings.
    pub fn string_map_or_empty(&self, key: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        if self.contains_key(key) {
            self.get_struct(key)
        } else {
            Ok(BTreeMap::new())
        }
    }
}
