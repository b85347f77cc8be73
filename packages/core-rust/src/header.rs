//! Ordered, case-insensitive, multi-valued header container.
//!
//! Header names are matched case-insensitively. Values are stored under the
//! lowercase form of the name, while a separate insertion-ordered key list
//! keeps the casing each name was first submitted with. Downstream protocols
//! that must echo the caller's casing (the framed RPC header map, for
//! instance) read names from that list.
//!
//! # Invariants
//!
//! - Every key in the key-order list resolves in the value map.
//! - Every entry in the value map has exactly one key in the key-order list.
//! - No entry in the value map holds an empty value list.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Returns the lookup form of a header name (ASCII lowercase).
#[must_use]
pub fn lookup_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Returns the canonical MIME form of a header name (`x-request-uuid` ->
/// `X-Request-Uuid`).
///
/// Each `-` separated segment starts with an uppercase letter and continues
/// in lowercase. Names containing characters outside `[A-Za-z0-9-]` are
/// returned unchanged.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return name.to_string();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Ordered, case-insensitive multi-map of header names to values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    values: HashMap<String, Vec<String>>,
    keys: Vec<String>,
}

impl Headers {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value stored under `name`, matching case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&lookup_key(name))
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Returns every value stored under `name` in insertion order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.values
            .get(&lookup_key(name))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Returns `true` if at least one value exists for `name`.
    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.values.contains_key(&lookup_key(name))
    }

    /// Appends `value` to the values stored under `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = lookup_key(&name);
        match self.values.get_mut(&key) {
            Some(values) => values.push(value.into()),
            None => {
                self.values.insert(key, vec![value.into()]);
                self.keys.push(name);
            }
        }
    }

    /// Replaces all values stored under `name` with a single `value`.
    ///
    /// An existing name keeps its original casing and position in the key
    /// order.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = lookup_key(&name);
        match self.values.get_mut(&key) {
            Some(values) => {
                values.clear();
                values.push(value.into());
            }
            None => {
                self.values.insert(key, vec![value.into()]);
                self.keys.push(name);
            }
        }
    }

    /// Removes `name` and returns its values, if any.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let key = lookup_key(name);
        let removed = self.values.remove(&key)?;
        self.keys.retain(|k| lookup_key(k) != key);
        Some(removed)
    }

    /// Iterates over header names in insertion order, with their submitted casing.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Iterates over `(name, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.keys.iter().map(move |k| {
            let values = self
                .values
                .get(&lookup_key(k))
                .map_or(&[][..], Vec::as_slice);
            (k.as_str(), values)
        })
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no header is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the first name in `required` with no value, if any.
    #[must_use]
    pub fn first_missing<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Option<&'a str> {
        required
            .iter()
            .map(AsRef::as_ref)
            .find(|name| !self.contains_key(name))
    }

    /// Adds every header from `defaults` whose name is not already present.
    ///
    /// Existing values win; this is how client default headers are layered
    /// underneath caller-supplied ones.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        for (name, values) in defaults.iter() {
            if self.contains_key(name) {
                continue;
            }
            for value in values {
                self.add(name, value.clone());
            }
        }
    }

    /// Flattens to a single value per name, keyed by the submitted casing.
    ///
    /// Used by protocols whose header carrier is a plain string map.
    #[must_use]
    pub fn to_single_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .filter_map(|(k, v)| v.first().map(|first| (k.to_string(), first.clone())))
            .collect()
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.add(k, v);
        }
        headers
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.add(k, v);
        }
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}
