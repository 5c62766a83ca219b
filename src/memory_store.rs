//! In-process entry store. Used by tests and `--memory` mode.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::dn::{self, EntryKey};
use crate::entry::{now_millis, DirectoryEntry, EntryRecord};
use crate::id::ItemId;
use crate::store::{EntryStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Row {
    key: EntryKey,
    record: EntryRecord,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Row>>,
    mutations: AtomicU64,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save/update/delete calls made so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Number of store calls of any kind made so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_mutation(&self) {
        self.record_call();
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn find_single_root(&self) -> StoreResult<Option<EntryRecord>> {
        self.record_call();
        let rows = self.rows.read().await;
        Ok(rows.iter().find(|r| r.key.is_root()).map(|r| r.record.clone()))
    }

    async fn find_all_roots(&self) -> StoreResult<Vec<EntryRecord>> {
        self.record_call();
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.key.is_root())
            .map(|r| r.record.clone())
            .collect())
    }

    async fn find_one_entry(&self, dn: &str) -> StoreResult<Option<EntryRecord>> {
        self.record_call();
        let key = EntryKey::from_dn(dn)?;
        let rows = self.rows.read().await;
        Ok(rows.iter().find(|r| r.key == key).map(|r| r.record.clone()))
    }

    async fn find_children(&self, dn: &str) -> StoreResult<Vec<EntryRecord>> {
        self.record_call();
        let parent = dn::normalize(dn);
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.key.parent.as_deref() == Some(parent.as_str()))
            .map(|r| r.record.clone())
            .collect())
    }

    async fn save_entry(&self, entry: &DirectoryEntry, id: &ItemId) -> StoreResult<()> {
        self.record_mutation();
        let key = entry.key()?;
        let mut rows = self.rows.write().await;
        if rows.iter().any(|r| r.key == key) {
            return Err(StoreError::Duplicate(key.full_path()));
        }
        let now = now_millis();
        rows.push(Row {
            record: EntryRecord {
                entry_id: id.hex_string(),
                entry: DirectoryEntry::new(key.full_path(), entry.attributes.clone()),
                created_at: now,
                updated_at: now,
            },
            key,
        });
        Ok(())
    }

    async fn update_entry(&self, entry: &DirectoryEntry) -> StoreResult<u64> {
        self.record_mutation();
        let key = entry.key()?;
        let mut rows = self.rows.write().await;
        match rows.iter_mut().find(|r| r.key == key) {
            Some(row) => {
                row.record.entry.attributes = entry.attributes.clone();
                row.record.updated_at = now_millis();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_entry(&self, dn: &str) -> StoreResult<u64> {
        self.record_mutation();
        let key = EntryKey::from_dn(dn)?;
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.key != key);
        Ok((before - rows.len()) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.record_call();
        Ok(())
    }
}
