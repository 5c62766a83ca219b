use clap::Parser;
use ldap_directory::bootstrap::init_base_dn;
use ldap_directory::id::{IdGenerator, UuidGenerator};
use ldap_directory::memory_store::MemoryStore;
use ldap_directory::pg_store::PgEntryStore;
use ldap_directory::tls;
use ldap_directory::{Config, EntryStore, LdapHandler, LdapServer, Metrics, run_metrics_server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, error, warn};
use anyhow::{Context, Result};

#[derive(Parser)]
#[command(name = "ldap-directory")]
#[command(about = "LDAP v3 directory server - keeps the directory tree in PostgreSQL")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen URL (overrides config; e.g. ldap://:10389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Keep entries in process memory instead of PostgreSQL (lost on exit)
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_directory={},info", log_level))
        .init();

    info!("Starting LDAP directory server");

    let config = Config::from_file(&args.config)?;
    config.validate(args.memory)?;
    let listen_url = args
        .listen
        .clone()
        .unwrap_or_else(|| config.listen.url.clone());

    info!("Configuration loaded from {:?}:", args.config);
    info!("  Listen URL: {}", listen_url);
    info!("  Bind base DN: {}", config.directory.bind_base_dn);
    info!("  Storage: {}", if args.memory { "memory" } else { "postgres" });
    info!("  TLS: {}", config.tls_enabled().is_some());

    let (store, pg): (Arc<dyn EntryStore>, Option<Arc<PgEntryStore>>) = if args.memory {
        warn!("Using the in-memory store; entries are lost on exit");
        (Arc::new(MemoryStore::new()) as Arc<dyn EntryStore>, None)
    } else {
        let storage = config
            .storage
            .as_ref()
            .context("storage section is required")?;
        let pg = Arc::new(
            PgEntryStore::connect(&storage.pool_config())
                .await
                .context("Failed to connect to PostgreSQL")?,
        );
        if storage.run_migrations() {
            pg.migrate().await.context("Failed to apply schema migrations")?;
            info!("Schema migrations applied");
        }
        (pg.clone() as Arc<dyn EntryStore>, Some(pg))
    };
    let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

    let outcome = init_base_dn(store.as_ref(), ids.as_ref(), &config.init)
        .await
        .context("Bootstrap failed")?;
    info!("Bootstrap: {:?}", outcome);

    let tls_acceptor = match config.tls_enabled() {
        Some(tls_cfg) => {
            let acceptor = tls::acceptor_from_config(tls_cfg)?;
            info!("TLS enabled (StartTLS{})", if tls_cfg.listen_url.is_some() { " and LDAPS" } else { "" });
            Some(acceptor)
        }
        None => None,
    };

    let handler = Arc::new(LdapHandler::new(
        Arc::clone(&store),
        ids,
        config.directory.bind_base_dn.clone(),
    ));
    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let store_for_ready = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, store_for_ready).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let plain = LdapServer::new(listen_url, Arc::clone(&handler), Arc::clone(&metrics), tls_acceptor.clone());
    let plain_listener = plain.bind().await?;

    let secure = match (config.tls_enabled().and_then(|t| t.listen_url.clone()), &tls_acceptor) {
        (Some(url), Some(_)) => {
            let server = LdapServer::new(url, Arc::clone(&handler), Arc::clone(&metrics), tls_acceptor.clone());
            let listener = server.bind().await?;
            Some((server, listener))
        }
        _ => None,
    };

    let ldaps = async {
        match secure {
            Some((server, listener)) => server.serve(listener).await,
            None => std::future::pending::<Result<()>>().await,
        }
    };

    tokio::select! {
        r = plain.serve(plain_listener) => r?,
        r = ldaps => r?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    if let Some(pg) = pg {
        pg.close().await;
        info!("PostgreSQL pool closed");
    }
    Ok(())
}
