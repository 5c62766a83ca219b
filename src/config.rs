use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{bail, Context, Result};

use crate::dn::EntryKey;
use crate::pg_store::PgStoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    /// PostgreSQL connection. May be omitted only when running with the in-memory store.
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub tls: Option<TlsConfig>,
    pub init: InitConfig,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (store reachable).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub url: String,
    /// Pool size (default 10).
    pub max_connections: Option<u32>,
    /// Seconds to wait for a pooled connection before failing the request (default 10).
    pub acquire_timeout_sec: Option<u64>,
    /// Apply embedded schema migrations at startup (default true).
    pub run_migrations: Option<bool>,
}

impl StorageConfig {
    pub fn pool_config(&self) -> PgStoreConfig {
        let mut pool = PgStoreConfig::new(self.url.clone());
        if let Some(n) = self.max_connections {
            pool.max_connections = n;
        }
        if let Some(secs) = self.acquire_timeout_sec {
            pool.acquire_timeout = Duration::from_secs(secs);
        }
        pool
    }

    pub fn run_migrations(&self) -> bool {
        self.run_migrations.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Short bind names are resolved as `cn=<name>,<bind_base_dn>`.
    #[serde(default)]
    pub bind_base_dn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enable: bool,
    /// Optional second listener where connections are TLS from the first byte (ldaps://).
    pub listen_url: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// One structural entry created on first start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEntry {
    pub dn: String,
    #[serde(default)]
    pub object_classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminEntry {
    pub dn: String,
    #[serde(default)]
    pub object_classes: Vec<String>,
    pub user_password: String,
}

/// Seed data. The admin entry is always created, after the structural entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub entries: Vec<InitEntry>,
    pub admin: AdminEntry,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// TLS settings when TLS is switched on.
    pub fn tls_enabled(&self) -> Option<&TlsConfig> {
        self.tls.as_ref().filter(|t| t.enable)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self, memory_store: bool) -> Result<()> {
        if self.storage.is_none() && !memory_store {
            bail!("storage.url is required unless the in-memory store is used");
        }
        if let Some(tls) = self.tls_enabled() {
            if tls.cert_file.is_none() || tls.key_file.is_none() {
                bail!("tls.enable requires tls.cert_file and tls.key_file");
            }
        }
        for entry in &self.init.entries {
            EntryKey::from_dn(&entry.dn).with_context(|| format!("init.entries: invalid DN '{}'", entry.dn))?;
        }
        let admin = &self.init.admin;
        EntryKey::from_dn(&admin.dn).with_context(|| format!("init.admin: invalid DN '{}'", admin.dn))?;
        if admin.user_password.is_empty() {
            bail!("init.admin.user_password must not be empty");
        }
        Ok(())
    }
}
