use anyhow::{Context, Result};
use identity_bridge::admin_token::{run_admin_token_tick, AdminTokenManager};
use identity_bridge::api::{create_router, AppState};
use identity_bridge::config::{load_config, site_secret_from_env, BridgeConfig};
use identity_bridge::credentials::{SecretCipher, SqliteTokenStore, TokenStore};
use identity_bridge::directory::{
    ForumDirectory, HostAccounts, NullForumDirectory, SqliteForumDirectory, SqliteHostAccounts,
};
use identity_bridge::identity::{IdentityResolver, IdentityStore, NoopResolverHook, SqliteIdentityStore};
use identity_bridge::lifecycle::{LifecycleDeps, TokenHelper};
use identity_bridge::services::ServiceCredentialStore;
use identity_bridge::video::{HttpVideoPlatform, NullVideoPlatform, VideoPlatformClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_bridge=info".into()),
        )
        .init();

    info!("Identity bridge starting...");

    let config_path = std::env::var("IDENTITY_BRIDGE_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));
    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => BridgeConfig::default(),
    };
    config.apply_env()?;
    config.validate().context("Invalid configuration")?;

    info!(
        config_path = config_path.as_deref().unwrap_or("<defaults>"),
        db_path = %config.storage.db_path,
        host_db = %config.host.path,
        bind = %config.api.bind,
        "Configuration loaded"
    );
    if config.api.admin_token.is_none() {
        warn!("No API token configured; the HTTP API is unrestricted");
    }

    let cipher = SecretCipher::from_site_secret(&site_secret_from_env()?)?;
    let db_path = &config.storage.db_path;

    let services = Arc::new(
        ServiceCredentialStore::new(db_path, cipher.clone())
            .context("Failed to initialize service config store")?,
    );
    let identities: Arc<dyn IdentityStore> = Arc::new(
        SqliteIdentityStore::new(db_path).context("Failed to initialize identity map")?,
    );
    let tokens: Arc<dyn TokenStore> =
        Arc::new(SqliteTokenStore::new(db_path).context("Failed to initialize token store")?);
    let host: Arc<dyn HostAccounts> = Arc::new(
        SqliteHostAccounts::open(config.host.clone())
            .context("Failed to open host account table")?,
    );
    info!("Stores initialized");

    let service_config = services.load().context("Failed to load service config")?;

    let forum: Arc<dyn ForumDirectory> = match service_config.forum_db.clone() {
        Some(forum_db) => Arc::new(
            SqliteForumDirectory::open(forum_db).context("Failed to open forum database")?,
        ),
        None => {
            warn!("Forum database not configured; username resolution disabled");
            Arc::new(NullForumDirectory)
        }
    };

    let (video, video_endpoint): (Arc<dyn VideoPlatformClient>, Option<Arc<HttpVideoPlatform>>) =
        if config.lifecycle.video_enabled {
            let base_url = service_config.video_api.as_ref().map(|api| api.base_url.clone());
            let endpoint = Arc::new(
                HttpVideoPlatform::new(
                    base_url,
                    Duration::from_secs(config.lifecycle.http_timeout_secs),
                )
                .context("Failed to build video platform client")?,
            );
            (endpoint.clone(), Some(endpoint))
        } else {
            warn!("Video platform integration disabled");
            (Arc::new(NullVideoPlatform), None)
        };

    let admin_token = Arc::new(AdminTokenManager::new(
        services.clone(),
        video.clone(),
        &config.admin_token,
    ));

    let deps = LifecycleDeps {
        identities: identities.clone(),
        tokens: tokens.clone(),
        host: host.clone(),
        forum: forum.clone(),
        video,
        admin: admin_token.clone(),
        cipher,
    };
    let resolver = Arc::new(IdentityResolver::new(
        host,
        identities.clone(),
        forum,
        Arc::new(NoopResolverHook),
    ));
    let helper = Arc::new(TokenHelper::new(
        deps,
        resolver,
        chrono::Duration::seconds(config.lifecycle.refresh_skew_secs),
    ));

    if config.admin_token.tick_interval_secs > 0 {
        tokio::spawn(run_admin_token_tick(
            admin_token.clone(),
            Duration::from_secs(config.admin_token.tick_interval_secs),
        ));
    }

    let app = create_router(AppState {
        helper,
        identities,
        tokens,
        services,
        admin_token,
        video_endpoint,
        api_token: config.api.admin_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind))?;
    info!(bind = %config.api.bind, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Identity bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
