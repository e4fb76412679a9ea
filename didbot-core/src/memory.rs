//! Machine memory: the string register map shared by rules, templates and scripts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Register that holds the triggering content while a script runs.
pub const INPUT: &str = "INPUT";
/// Register a script writes its result to.
pub const OUTPUT: &str = "OUTPUT";
/// Register a script may write a next-state override to.
pub const TARGET: &str = "TARGET";
/// Register a script may write a diagnostic message to.
pub const ERROR: &str = "ERROR";
/// Register `GEN_PIN` stores the generated PIN in.
pub const PIN: &str = "PIN";

/// Mutable scratch registers scoped to one machine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memory(HashMap<String, String>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the register value, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the register value, treating an absent register as empty.
    pub fn get_or_empty(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the underlying map (used as template context).
    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Memory {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
