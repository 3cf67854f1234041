// HTTP API: session hooks for the host CMS and the admin surface

pub mod admin;
pub mod auth;
pub mod session;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::admin_token::AdminTokenManager;
use crate::credentials::TokenStore;
use crate::error::BridgeError;
use crate::identity::IdentityStore;
use crate::lifecycle::TokenHelper;
use crate::services::ServiceCredentialStore;
use crate::video::HttpVideoPlatform;

pub use admin::create_admin_router;
pub use session::create_session_router;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub helper: Arc<TokenHelper>,
    pub identities: Arc<dyn IdentityStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub services: Arc<ServiceCredentialStore>,
    pub admin_token: Arc<AdminTokenManager>,
    /// Repointed when the settings screen changes the base URL
    pub video_endpoint: Option<Arc<HttpVideoPlatform>>,
    /// Required bearer token. None = API unrestricted.
    pub api_token: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::DownstreamUnavailable(_) | BridgeError::NotConfigured(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::AuthRejected(_) | BridgeError::RepairFailed { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::NoCredentialInScope | BridgeError::NoRefreshToken => StatusCode::CONFLICT,
            BridgeError::MappingMismatch { .. } => StatusCode::CONFLICT,
            BridgeError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

/// Full router: session and admin routes behind the bearer check, with
/// request tracing.
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(create_session_router(state.clone()))
        .merge(create_admin_router(state.clone()))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ))
        .layer(TraceLayer::new_for_http())
}
