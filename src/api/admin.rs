use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_response, AppState};
use crate::identity::delete_account;
use crate::services::ServiceConfigUpdate;

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

pub fn create_admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/admin/services", get(get_services).put(put_services))
        .route("/api/admin/video/admin-token", get(get_admin_token))
        .route(
            "/api/admin/video/admin-token/refresh",
            post(refresh_admin_token),
        )
        .route(
            "/api/admin/identities/:forum_id",
            get(get_identity).delete(delete_identity),
        )
        .with_state(state)
}

/// GET /api/admin/services — current configuration with secrets redacted.
async fn get_services(State(state): State<Arc<AppState>>) -> Response {
    match state.services.load() {
        Ok(config) => Json(config.redacted()).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to load service config");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

/// PUT /api/admin/services — partial update. Blank secrets keep the stored value.
async fn put_services(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ServiceConfigUpdate>,
) -> Response {
    let config = match state.services.apply_update(update) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("{:#}", e)),
    };

    if let Some(endpoint) = &state.video_endpoint {
        endpoint.set_base_url(config.video_api.as_ref().map(|api| api.base_url.clone()));
    }
    info!(version = config.version, "Service config updated");

    Json(config.redacted()).into_response()
}

/// GET /api/admin/video/admin-token — state and expiry, never the token.
async fn get_admin_token(State(state): State<Arc<AppState>>) -> Response {
    match state.admin_token.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/admin/video/admin-token/refresh — manual refresh trigger.
async fn refresh_admin_token(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = state.admin_token.force_refresh().await {
        warn!(error = %e, "Manual admin token refresh failed");
        return e.into_response();
    }
    match state.admin_token.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/admin/identities/:forum_id
async fn get_identity(State(state): State<Arc<AppState>>, Path(forum_id): Path<i64>) -> Response {
    match state.identities.get(forum_id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Identity not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

/// DELETE /api/admin/identities/:forum_id — removes the identity and its tokens.
async fn delete_identity(
    State(state): State<Arc<AppState>>,
    Path(forum_id): Path<i64>,
) -> Response {
    match delete_account(state.identities.as_ref(), state.tokens.as_ref(), forum_id) {
        Ok(true) => Json(DeleteResponse { deleted: true }).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Identity not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}
