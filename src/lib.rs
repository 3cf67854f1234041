// Shared SQLite helpers
mod db;

// Error taxonomy for the credential lifecycle
pub mod error;

// Configuration (TOML + environment)
pub mod config;

// Encryption and per-user token storage
pub mod credentials;

// Downstream service configuration and leases
pub mod services;

// Accounts owned by the host CMS, the forum and the video platform
pub mod directory;

// Identity map and resolver
pub mod identity;

// Request-scoped password capture
pub mod capture;

// Video platform API client
pub mod video;

// Admin service token
pub mod admin_token;

// Mint, refresh and the request-facing token helper
pub mod lifecycle;

// HTTP API
pub mod api;

pub use db::validate_identifier;
pub use error::BridgeError;
