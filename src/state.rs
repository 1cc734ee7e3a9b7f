//! Structured registry state: keys mapped to their values.

use crate::key::KeyPath;
use crate::value::RegistryValue;
use std::collections::btree_map::{self, BTreeMap};

/// Values of one key, by value name.
pub type ValueMap = BTreeMap<String, RegistryValue>;

/// Mapping from key path to that key's values.
///
/// A key mapped to an empty [`ValueMap`] exists but has no enumerated values,
/// which is distinct from the key being absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RegistryStruct {
    keys: BTreeMap<KeyPath, ValueMap>,
}

impl RegistryStruct {
    /// Creates an empty structure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures `key` is present, returning its value map.
    pub fn insert_key(&mut self, key: impl Into<KeyPath>) -> &mut ValueMap {
        self.keys.entry(key.into()).or_default()
    }

    /// Sets `name` under `key`, creating the key if needed.
    ///
    /// An existing value whose name differs only by case is replaced.
    pub fn insert_value(
        &mut self,
        key: impl Into<KeyPath>,
        name: impl Into<String>,
        value: RegistryValue,
    ) {
        let name = name.into();
        let values = self.insert_key(key);
        if let Some(existing) = find_value_name(values, &name).map(str::to_string) {
            values.remove(&existing);
        }
        values.insert(name, value);
    }

    /// Builder-style [`insert_value`](Self::insert_value).
    pub fn with_value(
        mut self,
        key: impl Into<KeyPath>,
        name: impl Into<String>,
        value: RegistryValue,
    ) -> Self {
        self.insert_value(key, name, value);
        self
    }

    /// Builder-style [`insert_key`](Self::insert_key).
    pub fn with_key(mut self, key: impl Into<KeyPath>) -> Self {
        self.insert_key(key);
        self
    }

    /// Returns the values of `key`, if present.
    pub fn get(&self, key: &KeyPath) -> Option<&ValueMap> {
        self.keys.get(key)
    }

    /// Returns true if `key` is present (with or without values).
    pub fn contains_key(&self, key: &KeyPath) -> bool {
        self.keys.contains_key(key)
    }

    /// Looks up a value by case-insensitive name.
    pub fn value(&self, key: &KeyPath, name: &str) -> Option<&RegistryValue> {
        let values = self.keys.get(key)?;
        find_value(values, name).map(|(_, v)| v)
    }

    /// Removes a key and its values.
    pub fn remove_key(&mut self, key: &KeyPath) -> Option<ValueMap> {
        self.keys.remove(key)
    }

    /// Removes `key` and every descendant key, returning how many were
    /// removed.
    pub fn remove_tree(&mut self, key: &KeyPath) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k, _| !key.is_ancestor_of(k));
        before - self.keys.len()
    }

    /// Removes a value by case-insensitive name.
    pub fn remove_value(&mut self, key: &KeyPath, name: &str) -> Option<RegistryValue> {
        let values = self.keys.get_mut(key)?;
        let stored = find_value_name(values, name)?.to_string();
        values.remove(&stored)
    }

    /// Iterates over present keys.
    pub fn keys(&self) -> btree_map::Keys<'_, KeyPath, ValueMap> {
        self.keys.keys()
    }

    /// Iterates over keys and their values.
    pub fn iter(&self) -> btree_map::Iter<'_, KeyPath, ValueMap> {
        self.keys.iter()
    }

    /// Number of present keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is present.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Shallow-merges `other` into `self`: per key, `other`'s values override
    /// same-named values already present.
    pub fn merge_from(&mut self, other: RegistryStruct) {
        for (key, values) in other.keys {
            let target = self.insert_key(key);
            for (name, value) in values {
                if let Some(existing) = find_value_name(target, &name).map(str::to_string) {
                    target.remove(&existing);
                }
                target.insert(name, value);
            }
        }
    }
}

impl<'a> IntoIterator for &'a RegistryStruct {
    type Item = (&'a KeyPath, &'a ValueMap);
    type IntoIter = btree_map::Iter<'a, KeyPath, ValueMap>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

impl FromIterator<(KeyPath, ValueMap)> for RegistryStruct {
    fn from_iter<I: IntoIterator<Item = (KeyPath, ValueMap)>>(iter: I) -> Self {
        let mut out = RegistryStruct::new();
        for (key, values) in iter {
            out.merge_from(RegistryStruct {
                keys: BTreeMap::from([(key, values)]),
            });
        }
        out
    }
}

/// Finds a value by case-insensitive name, returning the stored name.
///
/// With several case variants present the last one in map order wins.
pub fn find_value<'a>(values: &'a ValueMap, name: &str) -> Option<(&'a str, &'a RegistryValue)> {
    values
        .iter()
        .filter(|(n, _)| n.to_lowercase() == name.to_lowercase())
        .last()
        .map(|(n, v)| (n.as_str(), v))
}

fn find_value_name<'a>(values: &'a ValueMap, name: &str) -> Option<&'a str> {
    find_value(values, name).map(|(n, _)| n)
}

/// Result of one or more queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryResult {
    /// Keys and values that were found.
    pub data: RegistryStruct,

    /// Queried key paths that do not exist.
    pub missing_keys: Vec<KeyPath>,

    /// Set when best-effort parsing skipped malformed lines.
    pub had_errors: bool,
}

impl QueryResult {
    /// Wraps a parsed structure.
    pub fn found(data: RegistryStruct, had_errors: bool) -> Self {
        Self {
            data,
            missing_keys: Vec::new(),
            had_errors,
        }
    }

    /// Result for a queried key that does not exist.
    pub fn missing(key: KeyPath) -> Self {
        Self {
            data: RegistryStruct::new(),
            missing_keys: vec![key],
            had_errors: false,
        }
    }

    /// Returns true if `key` was reported missing.
    pub fn is_missing(&self, key: &KeyPath) -> bool {
        self.missing_keys.contains(key)
    }

    /// Merges results in issue order: later values override earlier ones for
    /// the same key and name, missing lists concatenate, error flags OR.
    pub fn merge(results: impl IntoIterator<Item = QueryResult>) -> QueryResult {
        results
            .into_iter()
            .fold(QueryResult::default(), |mut acc, result| {
                acc.data.merge_from(result.data);
                acc.missing_keys.extend(result.missing_keys);
                acc.had_errors |= result.had_errors;
                acc
            })
    }
}
