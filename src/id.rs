//! Entry identifiers.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("id generation failed: {0}")]
pub struct IdError(pub String);

/// Opaque 128-bit identifier, stored as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId([u8; 16]);

impl ItemId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn hex_string(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex_string())
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<ItemId, IdError>;
}

/// Random (v4) UUID source.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> Result<ItemId, IdError> {
        Ok(ItemId(Uuid::new_v4().into_bytes()))
    }
}
