use anyhow::{Context, Result};
use identity_bridge::config::{load_config, site_secret_from_env, BridgeConfig};
use identity_bridge::credentials::SecretCipher;
use identity_bridge::directory::{SqliteForumDirectory, SqliteHostAccounts, VideoAccountsDb};
use identity_bridge::identity::SqliteIdentityStore;
use identity_bridge::services::ServiceCredentialStore;
use reconciler::ReconcileScanner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reconciler=info".into()),
        )
        .init();

    info!("Reconciler starting...");

    let mut config = match std::env::var("IDENTITY_BRIDGE_CONFIG").ok() {
        Some(path) => load_config(&path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env()?;
    config.validate().context("Invalid configuration")?;

    // Unset means a single pass
    let interval = match std::env::var("RECONCILER_INTERVAL_SECS") {
        Ok(secs) => Some(Duration::from_secs(
            secs.parse()
                .context("RECONCILER_INTERVAL_SECS must be a number of seconds")?,
        )),
        Err(_) => None,
    };

    let cipher = SecretCipher::from_site_secret(&site_secret_from_env()?)?;
    let services = ServiceCredentialStore::new(&config.storage.db_path, cipher)
        .context("Failed to open service config store")?;
    let service_config = services.load().context("Failed to load service config")?;

    let forum_db = service_config
        .forum_db
        .context("Forum database is not configured; nothing to reconcile")?;
    let forum = Arc::new(SqliteForumDirectory::open(forum_db)?);
    let host = Arc::new(SqliteHostAccounts::open(config.host.clone())?);
    let identities = Arc::new(
        SqliteIdentityStore::new(&config.storage.db_path)
            .context("Failed to open identity map")?,
    );
    let video_accounts = match service_config.video_db {
        Some(video_db) => Some(Arc::new(VideoAccountsDb::open(video_db)?)),
        None => {
            warn!("Video database not configured; video links will not be reconciled");
            None
        }
    };

    let scanner = Arc::new(ReconcileScanner::new(forum, host, identities, video_accounts));

    info!(
        db_path = %config.storage.db_path,
        interval_secs = interval.map(|i| i.as_secs()),
        "Configuration loaded"
    );

    let Some(interval) = interval.filter(|i| !i.is_zero()) else {
        let report = run_pass(scanner).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    };

    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = run_pass(scanner.clone()).await {
                    error!(error = %e, "Reconciliation pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}

/// Runs one scan on the blocking pool; the stores are synchronous SQLite.
async fn run_pass(scanner: Arc<ReconcileScanner>) -> Result<reconciler::ScanReport> {
    tokio::task::spawn_blocking(move || scanner.scan())
        .await
        .context("Reconciliation task panicked")?
}
