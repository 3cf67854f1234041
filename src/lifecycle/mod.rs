//! Per-user video platform token lifecycle.
//!
//! [`TokenHelper`] is the entry point for request handlers. It resolves the
//! forum account, consults [`RefreshEngine`] for a stored token, and falls
//! through to [`MintEngine`] only inside a login request, where the password
//! captured in the [`RequestScope`](crate::capture::RequestScope) is available.

use std::sync::Arc;

use crate::admin_token::AdminTokenManager;
use crate::credentials::{SecretCipher, TokenStore};
use crate::directory::{ForumDirectory, HostAccounts};
use crate::identity::IdentityStore;
use crate::video::VideoPlatformClient;

pub mod helper;
pub mod mint;
pub mod refresh;

pub use helper::{LoginOutcome, TokenHelper};
pub use mint::MintEngine;
pub use refresh::{needs_refresh, RefreshEngine, RefreshOutcome, DEFAULT_TOKEN_TTL};

/// Collaborators shared by the engines.
#[derive(Clone)]
pub struct LifecycleDeps {
    pub identities: Arc<dyn IdentityStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub host: Arc<dyn HostAccounts>,
    pub forum: Arc<dyn ForumDirectory>,
    pub video: Arc<dyn VideoPlatformClient>,
    pub admin: Arc<AdminTokenManager>,
    pub cipher: SecretCipher,
}
