use anyhow::{Context, Result};
use serde::Deserialize;

// Re-export existing config types
pub use crate::directory::HostDbConfig;

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub host: HostDbConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub admin_token: AdminTokenConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Bridge-owned SQLite database (identity map, tokens, service config)
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "identity_bridge.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Per-user token lifecycle
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Refresh this many seconds before a user token expires
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,
    /// Timeout applied to every video platform request
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// When false every video platform call fails with "not configured"
    #[serde(default = "default_video_enabled")]
    pub video_enabled: bool,
}

fn default_refresh_skew() -> i64 {
    60
}

fn default_http_timeout() -> u64 {
    5
}

fn default_video_enabled() -> bool {
    true
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: default_refresh_skew(),
            http_timeout_secs: default_http_timeout(),
            video_enabled: default_video_enabled(),
        }
    }
}

/// Admin service-token manager
#[derive(Debug, Clone, Deserialize)]
pub struct AdminTokenConfig {
    #[serde(default = "default_near_expiry_skew")]
    pub near_expiry_skew_secs: i64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
    /// 0 disables the background tick
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_near_expiry_skew() -> i64 {
    300
}

fn default_lease_ttl() -> i64 {
    30
}

fn default_tick_interval() -> u64 {
    60
}

impl Default for AdminTokenConfig {
    fn default() -> Self {
        Self {
            near_expiry_skew_secs: default_near_expiry_skew(),
            lease_ttl_secs: default_lease_ttl(),
            tick_interval_secs: default_tick_interval(),
        }
    }
}

/// HTTP API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token for every route. `None` leaves the API open (development only).
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:3100".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_token: None,
        }
    }
}

impl BridgeConfig {
    /// Applies `IDENTITY_BRIDGE_*` overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("IDENTITY_BRIDGE_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(path) = var("IDENTITY_BRIDGE_HOST_DB_PATH") {
            self.host.path = path;
        }
        if let Some(bind) = var("IDENTITY_BRIDGE_BIND") {
            self.api.bind = bind;
        }
        if let Some(token) = var("IDENTITY_BRIDGE_ADMIN_TOKEN") {
            self.api.admin_token = Some(token).filter(|t| !t.trim().is_empty());
        }
        if let Some(secs) = var("IDENTITY_BRIDGE_HTTP_TIMEOUT_SECS") {
            self.lifecycle.http_timeout_secs = secs
                .parse()
                .context("IDENTITY_BRIDGE_HTTP_TIMEOUT_SECS must be a number of seconds")?;
        }
        if let Some(secs) = var("IDENTITY_BRIDGE_TICK_INTERVAL_SECS") {
            self.admin_token.tick_interval_secs = secs
                .parse()
                .context("IDENTITY_BRIDGE_TICK_INTERVAL_SECS must be a number of seconds")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        if self.lifecycle.http_timeout_secs == 0 {
            anyhow::bail!("lifecycle.http_timeout_secs must be positive");
        }
        check_range(
            "lifecycle.refresh_skew_secs",
            self.lifecycle.refresh_skew_secs,
            0,
            MAX_SKEW_SECS,
        )?;
        check_range(
            "admin_token.near_expiry_skew_secs",
            self.admin_token.near_expiry_skew_secs,
            0,
            MAX_SKEW_SECS,
        )?;
        check_range(
            "admin_token.lease_ttl_secs",
            self.admin_token.lease_ttl_secs,
            1,
            MAX_LEASE_TTL_SECS,
        )?;
        Ok(())
    }
}

/// Upper bound for the refresh skews (one day).
const MAX_SKEW_SECS: i64 = 86_400;

/// Upper bound for the admin token lease (one hour).
const MAX_LEASE_TTL_SECS: i64 = 3_600;

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {}, got {}", name, min, max, value);
    }
    Ok(())
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: BridgeConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}

/// Reads the site secret that keys every stored ciphertext.
pub fn site_secret_from_env() -> Result<String> {
    std::env::var("IDENTITY_BRIDGE_SITE_SECRET")
        .context("IDENTITY_BRIDGE_SITE_SECRET is required")
}
