//! Directory entries and their attribute lists.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dn::{DnError, EntryKey};

pub const ATTR_OBJECT_CLASS: &str = "objectClass";
pub const ATTR_USER_PASSWORD: &str = "userPassword";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttribute {
    pub name: String,
    pub values: Vec<String>,
}

/// Ordered attribute list. Names are unique and case-sensitive; values keep
/// insertion order and are never deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Vec<EntryAttribute>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs. A repeated name appends to the first
    /// occurrence, so lookups never have more than one match.
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<V>)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut attrs = Self::new();
        for (name, values) in pairs {
            attrs.add_values(name, values.into_iter().map(Into::into).collect());
        }
        attrs
    }

    pub fn get(&self, name: &str) -> Option<&EntryAttribute> {
        self.0.iter().find(|a| a.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut EntryAttribute> {
        self.0.iter_mut().find(|a| a.name == name)
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }

    /// Append to an existing attribute or create it.
    pub fn add_values(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(attr) => attr.values.extend(values),
            None => self.0.push(EntryAttribute { name, values }),
        }
    }

    /// Remove the whole attribute. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|a| a.name != name);
        self.0.len() != before
    }

    /// Overwrite the values of an existing attribute. Never creates one.
    pub fn replace_values(&mut self, name: &str, values: Vec<String>) -> bool {
        match self.get_mut(name) {
            Some(attr) => {
                attr.values = values;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryAttribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-establish the single-name invariant on data read back from storage.
    pub fn merged(self) -> Self {
        let mut out = Self::new();
        for attr in self.0 {
            out.add_values(attr.name, attr.values);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: Attributes,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    pub fn key(&self) -> Result<EntryKey, DnError> {
        EntryKey::from_dn(&self.dn)
    }
}

/// A stored entry with its identity and timestamps (ms since epoch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub entry_id: String,
    pub entry: DirectoryEntry,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
