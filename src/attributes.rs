//! Test attributes and their inheritance.
//!
//! An attribute is a named flag or key/value pair attached to a test or
//! suite: `skip`, `timeout`, `expected-failure`, and so on. The core
//! interprets only `skip` and `timeout`; everything else is carried
//! verbatim for outer layers (reporters, filters) to act on.
//!
//! Inheritance is resolved once, at suite compilation: a test's own
//! attributes are united over those inherited from its enclosing
//! suites, own entries winning on conflict. Nothing looks back up the
//! tree at run time.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attribute name the orchestrator reads to skip a test.
pub const SKIP: &str = "skip";
/// Attribute name the isolation engine reads as a per-test deadline,
/// in milliseconds.
pub const TIMEOUT: &str = "timeout";

/// A single named attribute, optionally carrying a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    /// A bare flag attribute.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// An attribute carrying a value.
    pub fn valued(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// An ordered set of attributes, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    entries: BTreeMap<String, Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common skip-marker case.
    pub fn skip() -> Self {
        let mut attrs = Self::new();
        attrs.set(SKIP);
        attrs
    }

    /// Convenience constructor for a timeout deadline.
    pub fn timeout(deadline: Duration) -> Self {
        let mut attrs = Self::new();
        attrs.set_value(TIMEOUT, deadline.as_millis().to_string());
        attrs
    }

    pub fn insert(&mut self, attr: Attribute) {
        self.entries.insert(attr.name.clone(), attr);
    }

    /// Sets a bare flag attribute.
    pub fn set(&mut self, name: &str) {
        self.insert(Attribute::flag(name));
    }

    /// Sets a valued attribute, replacing any previous entry.
    pub fn set_value(&mut self, name: &str, value: impl Into<String>) {
        self.insert(Attribute::valued(name, value));
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.entries.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.entries.values()
    }

    /// Whether the orchestrator should skip this test.
    pub fn skipped(&self) -> bool {
        self.is_set(SKIP)
    }

    /// The per-test deadline, if a well-formed `timeout` attribute is
    /// present. An unparseable value means no deadline.
    pub fn deadline(&self) -> Option<Duration> {
        self.get(TIMEOUT)
            .and_then(|attr| attr.value.as_deref())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    /// Unites `own` over `inherited`: the result contains both sets,
    /// with `own` entries taking precedence on conflict.
    pub fn unite(own: &Attributes, inherited: &Attributes) -> Attributes {
        let mut united = inherited.clone();
        for attr in own.iter() {
            united.insert(attr.clone());
        }
        united
    }
}
