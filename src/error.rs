//! Typed outcomes for the credential lifecycle.
//!
//! Expected negative outcomes (no linked forum identity, no stored token) are
//! modelled with `Option`/`Resolution`, not with this enum. Everything here is
//! something a caller may want to branch on.

use crate::video::VideoApiError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Mint attempted outside a login request. Caller bug; do not retry.
    #[error("no credential in this request")]
    NoCredentialInScope,

    /// Network failure, timeout or 5xx from a downstream system.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// The video platform rejected the presented credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// A stored cross-system link points at an account with another username.
    #[error("video account {video_account_id} reports username '{actual}', expected '{expected}'")]
    MappingMismatch {
        video_account_id: i64,
        expected: String,
        actual: String,
    },

    /// A store write or read failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Refresh needed but the row carries no refresh token.
    #[error("no refresh token stored")]
    NoRefreshToken,

    /// The downstream system has not been configured.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Every repair step was attempted and the final grant still failed.
    #[error("repair failed: {chain}")]
    RepairFailed { chain: String },
}

impl BridgeError {
    /// True for failures that may succeed on the next natural trigger.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::DownstreamUnavailable(_))
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        BridgeError::PersistenceFailure(format!("{:#}", err))
    }
}

impl From<VideoApiError> for BridgeError {
    fn from(err: VideoApiError) -> Self {
        match err {
            VideoApiError::Unavailable(msg) => BridgeError::DownstreamUnavailable(msg),
            VideoApiError::Rejected { status, body } if status == 400 || status == 401 => {
                BridgeError::AuthRejected(format!("status {}: {}", status, body))
            }
            VideoApiError::Rejected { status, body } if status >= 500 => {
                BridgeError::DownstreamUnavailable(format!("status {}: {}", status, body))
            }
            VideoApiError::Rejected { status, body } => {
                BridgeError::AuthRejected(format!("status {}: {}", status, body))
            }
            VideoApiError::NotFound(what) => {
                BridgeError::DownstreamUnavailable(format!("not found: {}", what))
            }
            VideoApiError::Malformed(msg) => BridgeError::DownstreamUnavailable(msg),
            VideoApiError::NotConfigured(msg) => BridgeError::NotConfigured(msg),
        }
    }
}
