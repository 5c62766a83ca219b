pub mod bootstrap;
pub mod config;
pub mod dn;
pub mod entry;
pub mod id;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod memory_store;
pub mod metrics;
pub mod pg_store;
pub mod server;
pub mod store;
pub mod tls;
pub mod value;

pub use config::Config;
pub use ldap_handler::LdapHandler;
pub use metrics::{Metrics, run_metrics_server};
pub use server::LdapServer;
pub use store::{EntryStore, StoreError};
