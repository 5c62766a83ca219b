//! Entry persistence seam.

use async_trait::async_trait;
use thiserror::Error;

use crate::dn::DnError;
use crate::entry::{DirectoryEntry, EntryRecord};
use crate::id::{IdError, IdGenerator, ItemId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry already exists: {0}")]
    Duplicate(String),
    #[error("timed out waiting for a store connection")]
    Timeout,
    #[error("database error: {0}")]
    Database(String),
    #[error("attribute serialization failed: {0}")]
    Serialization(String),
    #[error("invalid entry key: {0}")]
    InvalidKey(#[from] DnError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Flat storage of the directory tree. Every call is independent; nothing
/// here is transactional across calls.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Any one root entry.
    async fn find_single_root(&self) -> StoreResult<Option<EntryRecord>>;

    async fn find_all_roots(&self) -> StoreResult<Vec<EntryRecord>>;

    async fn find_one_entry(&self, dn: &str) -> StoreResult<Option<EntryRecord>>;

    /// Rows whose parent path equals the normalized `dn`.
    async fn find_children(&self, dn: &str) -> StoreResult<Vec<EntryRecord>>;

    async fn save_entry(&self, entry: &DirectoryEntry, id: &ItemId) -> StoreResult<()>;

    /// Rewrite attributes and bump `updated_at`. Returns rows affected, which
    /// is 0 when the entry vanished since it was read.
    async fn update_entry(&self, entry: &DirectoryEntry) -> StoreResult<u64>;

    async fn delete_entry(&self, dn: &str) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Assign a fresh id and insert. Shared by Add and bootstrap seeding.
pub async fn save_new_entry(
    store: &dyn EntryStore,
    ids: &dyn IdGenerator,
    entry: &DirectoryEntry,
) -> Result<ItemId, SaveError> {
    let id = ids.next_id()?;
    store.save_entry(entry, &id).await?;
    Ok(id)
}
