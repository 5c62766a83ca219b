//! Distinguished name handling: split a DN into RDN components and derive the
//! key an entry is stored under.
//!
//! Components are separated by `,` and trimmed. Escaped delimiters inside an
//! RDN value (`cn=Smith\, John`) are not recognised.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnError {
    #[error("empty distinguished name")]
    Empty,
    #[error("RDN component '{0}' has no '='")]
    MissingEquals(String),
}

/// Split `dn` on `,` and trim every component.
pub fn split_dn(dn: &str) -> Vec<String> {
    dn.split(',').map(|c| c.trim().to_string()).collect()
}

/// Components after the leading one, re-joined. Empty for a single component.
pub fn parent_path(components: &[String]) -> String {
    if components.len() <= 1 {
        String::new()
    } else {
        components[1..].join(",")
    }
}

pub fn full_path(components: &[String]) -> String {
    components.join(",")
}

/// Attribute label of an RDN component (`cn` for `cn=alice`).
pub fn entry_type(component: &str) -> Result<&str, DnError> {
    match component.split_once('=') {
        Some((label, _)) => Ok(label),
        None => Err(DnError::MissingEquals(component.to_string())),
    }
}

/// Natural key of a row: leading component, parent path (None for a root) and
/// entry type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub entry_name: String,
    pub parent: Option<String>,
    pub entry_type: String,
}

impl EntryKey {
    pub fn from_dn(dn: &str) -> Result<Self, DnError> {
        if dn.trim().is_empty() {
            return Err(DnError::Empty);
        }
        let components = split_dn(dn);
        let entry_name = components[0].clone();
        let entry_type = entry_type(&entry_name)?.to_string();
        let parent = parent_path(&components);
        Ok(Self {
            entry_name,
            parent: if parent.is_empty() { None } else { Some(parent) },
            entry_type,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Full normalized DN (trimmed components joined with `,`).
    pub fn full_path(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{},{}", self.entry_name, parent),
            None => self.entry_name.clone(),
        }
    }
}

/// Normalized full path of `dn`, the value children store as their parent path.
pub fn normalize(dn: &str) -> String {
    full_path(&split_dn(dn))
}
