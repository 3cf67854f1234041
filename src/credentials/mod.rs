//! Encrypted per-user token storage for the video platform.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Mint / Refresh engines             │
//! │  - plaintext TokenPair in memory only    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCipher                       │
//! │  - AES-256-GCM, key = SHA-256(secret)    │
//! │  - fresh nonce per call, prefixed        │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (SQLite)                │
//! │  - Ciphertext columns only               │
//! │  - upserts keyed by forum account id     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use identity_bridge::credentials::{SecretCipher, SqliteTokenStore, TokenStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cipher = SecretCipher::from_site_secret("site-wide master secret")?;
//! let store = SqliteTokenStore::new("bridge.db")?;
//!
//! let access = cipher.encrypt("access-token")?;
//! let refresh = cipher.encrypt("refresh-token")?;
//! store.save(7, &access, Some(&refresh), Some(Utc::now() + Duration::hours(1)))?;
//!
//! if let Some(record) = store.get(7)? {
//!     if let Some(enc) = &record.access_token_enc {
//!         println!("access token: {}", cipher.decrypt(enc)?);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{Ciphertext, SecretCipher};
pub use storage::{SqliteTokenStore, TokenRecord, TokenStore};

/// Plaintext OAuth token pair as returned by the video platform.
///
/// Only ever held in memory; persisted through [`SecretCipher`] as
/// [`Ciphertext`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Bearer token used for API requests
    pub access_token: String,

    /// Token used to obtain a new access token without the password
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
