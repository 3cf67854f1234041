use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;
use crate::capture::RequestScope;

/// Login notification from the host CMS.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub host_account_id: i64,
    pub password: String,
    /// Login string as typed
    #[serde(default)]
    pub identifier: String,
}

#[derive(Serialize)]
struct VideoTokenResponse {
    access_token: Option<String>,
}

pub fn create_session_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/session/login", post(login))
        .route("/api/accounts/:host_id/video-token", get(video_token))
        .with_state(state)
}

/// POST /api/session/login — capture the password and try to obtain a token
/// while it is available. The password is dropped with the request.
async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginRequest>) -> Response {
    let mut scope = RequestScope::new();
    let outcome = state
        .helper
        .complete_login(&mut scope, body.host_account_id, &body.password, &body.identifier)
        .await;
    scope.end();
    Json(outcome).into_response()
}

/// GET /api/accounts/:host_id/video-token — stored or refreshed token only;
/// never mints.
async fn video_token(State(state): State<Arc<AppState>>, Path(host_id): Path<i64>) -> Response {
    let access_token = state
        .helper
        .token_for_request(&RequestScope::new(), host_id)
        .await;
    Json(VideoTokenResponse { access_token }).into_response()
}
