//! PostgreSQL entry store.
//!
//! Rows live in `misc_ldap_entries`, keyed by (entry_name,
//! parent_full_entry_path, entry_type). A NULL parent marks a root. Each call
//! takes exactly one pooled connection and returns it when the call ends.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Error as SqlxError, Postgres};
use tracing::{debug, info};

use crate::dn::{self, EntryKey};
use crate::entry::{now_millis, Attributes, DirectoryEntry, EntryRecord};
use crate::id::ItemId;
use crate::store::{EntryStore, StoreError, StoreResult};

const SQL_FIND_SINGLE_ROOT: &str = "SELECT entry_id, entry_name, parent_full_entry_path, attribute, time_created, time_updated \
     FROM misc_ldap_entries WHERE parent_full_entry_path IS NULL LIMIT 1";

const SQL_FIND_ALL_ROOTS: &str = "SELECT entry_id, entry_name, parent_full_entry_path, attribute, time_created, time_updated \
     FROM misc_ldap_entries WHERE parent_full_entry_path IS NULL ORDER BY time_created, entry_id";

const SQL_FIND_ONE: &str = "SELECT entry_id, entry_name, parent_full_entry_path, attribute, time_created, time_updated \
     FROM misc_ldap_entries \
     WHERE entry_name = $1 AND parent_full_entry_path IS NOT DISTINCT FROM $2 AND entry_type = $3";

const SQL_FIND_CHILDREN: &str = "SELECT entry_id, entry_name, parent_full_entry_path, attribute, time_created, time_updated \
     FROM misc_ldap_entries WHERE parent_full_entry_path = $1 ORDER BY time_created, entry_id";

const SQL_INSERT: &str = "INSERT INTO misc_ldap_entries \
     (entry_id, entry_name, parent_full_entry_path, entry_type, attribute, metadata, time_created, time_updated) \
     VALUES ($1, $2, $3, $4, $5, NULL, $6, $6)";

const SQL_UPDATE: &str = "UPDATE misc_ldap_entries SET attribute = $1, time_updated = $2 \
     WHERE entry_name = $3 AND parent_full_entry_path IS NOT DISTINCT FROM $4 AND entry_type = $5";

const SQL_DELETE: &str = "DELETE FROM misc_ldap_entries \
     WHERE entry_name = $1 AND parent_full_entry_path IS NOT DISTINCT FROM $2 AND entry_type = $3";

/// Pool settings for [`PgEntryStore::connect`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    entry_id: String,
    entry_name: String,
    parent_full_entry_path: Option<String>,
    attribute: Json<Attributes>,
    time_created: i64,
    time_updated: i64,
}

impl From<EntryRow> for EntryRecord {
    fn from(row: EntryRow) -> Self {
        let dn = match row.parent_full_entry_path {
            Some(parent) => format!("{},{}", row.entry_name, parent),
            None => row.entry_name,
        };
        EntryRecord {
            entry_id: row.entry_id,
            entry: DirectoryEntry::new(dn, row.attribute.0.merged()),
            created_at: row.time_created,
            updated_at: row.time_updated,
        }
    }
}

pub fn from_sqlx_error(err: SqlxError) -> StoreError {
    match err {
        SqlxError::Database(db_err) if db_err.code().is_some_and(|c| c == "23505") => {
            StoreError::Duplicate(db_err.message().to_string())
        }
        SqlxError::PoolTimedOut => StoreError::Timeout,
        SqlxError::ColumnDecode { source, .. } => StoreError::Serialization(source.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}

pub struct PgEntryStore {
    pool: PgPool,
}

impl PgEntryStore {
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(from_sqlx_error)?;
        info!(
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "PostgreSQL pool ready"
        );
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn conn(&self) -> StoreResult<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(from_sqlx_error)
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn find_single_root(&self) -> StoreResult<Option<EntryRecord>> {
        let mut conn = self.conn().await?;
        let row: Option<EntryRow> = sqlx::query_as(SQL_FIND_SINGLE_ROOT)
            .fetch_optional(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(row.map(EntryRecord::from))
    }

    async fn find_all_roots(&self) -> StoreResult<Vec<EntryRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<EntryRow> = sqlx::query_as(SQL_FIND_ALL_ROOTS)
            .fetch_all(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(rows.into_iter().map(EntryRecord::from).collect())
    }

    async fn find_one_entry(&self, dn: &str) -> StoreResult<Option<EntryRecord>> {
        let key = EntryKey::from_dn(dn)?;
        let mut conn = self.conn().await?;
        let row: Option<EntryRow> = sqlx::query_as(SQL_FIND_ONE)
            .bind(&key.entry_name)
            .bind(&key.parent)
            .bind(&key.entry_type)
            .fetch_optional(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(row.map(EntryRecord::from))
    }

    async fn find_children(&self, dn: &str) -> StoreResult<Vec<EntryRecord>> {
        let parent = dn::normalize(dn);
        let mut conn = self.conn().await?;
        let rows: Vec<EntryRow> = sqlx::query_as(SQL_FIND_CHILDREN)
            .bind(&parent)
            .fetch_all(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(rows.into_iter().map(EntryRecord::from).collect())
    }

    async fn save_entry(&self, entry: &DirectoryEntry, id: &ItemId) -> StoreResult<()> {
        let key = entry.key()?;
        let mut conn = self.conn().await?;
        sqlx::query(SQL_INSERT)
            .bind(id.hex_string())
            .bind(&key.entry_name)
            .bind(&key.parent)
            .bind(&key.entry_type)
            .bind(Json(&entry.attributes))
            .bind(now_millis())
            .execute(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        debug!(dn = %key.full_path(), id = %id, "entry inserted");
        Ok(())
    }

    async fn update_entry(&self, entry: &DirectoryEntry) -> StoreResult<u64> {
        let key = entry.key()?;
        let mut conn = self.conn().await?;
        let result = sqlx::query(SQL_UPDATE)
            .bind(Json(&entry.attributes))
            .bind(now_millis())
            .bind(&key.entry_name)
            .bind(&key.parent)
            .bind(&key.entry_type)
            .execute(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_entry(&self, dn: &str) -> StoreResult<u64> {
        let key = EntryKey::from_dn(dn)?;
        let mut conn = self.conn().await?;
        let result = sqlx::query(SQL_DELETE)
            .bind(&key.entry_name)
            .bind(&key.parent)
            .bind(&key.entry_type)
            .execute(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(from_sqlx_error)?;
        Ok(())
    }
}
