//! First-party session endpoints (/auth/*).

use crate::AppResources;
use crate::api::auth::{ApiError, SessionAuth, bearer_token};
use crate::error::ServiceError;
use crate::session::{SessionInfo, SessionTokens};
use axum::{Extension, Json, extract::Path, http::HeaderMap, http::StatusCode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

pub const SESSIONS_TAG: &str = "Sessions";

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(refresh))
        .routes(routes!(logout))
        .routes(routes!(list_sessions))
        .routes(routes!(revoke_session))
        .routes(routes!(revoke_other_sessions))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokedCount {
    pub revoked: u64,
}

/// Rotate the session token pair.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/refresh",
    tag = SESSIONS_TAG,
    operation_id = "Refresh Session",
    summary = "Exchange a refresh token for a new pair",
    description = "The presented refresh token is single use. Replaying it after a successful refresh fails.",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = SessionTokens),
        (status = 401, description = "Refresh token unknown, expired or already used", body = ApiError),
    )
)]
pub async fn refresh(
    Extension(resources): Extension<AppResources>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<SessionTokens>, ApiError> {
    if req.refresh_token.is_empty() {
        return Err(ApiError::bad_request("refresh_token is required"));
    }
    match resources.sessions.refresh(&req.refresh_token).await {
        Ok(tokens) => Ok(Json(tokens)),
        Err(ServiceError::NotFound(msg)) => Err(ApiError::invalid_token(msg)),
        Err(e) => Err(ApiError::from_service(
            e,
            resources.config.expose_error_details,
        )),
    }
}

/// End the session the bearer token belongs to.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/logout",
    tag = SESSIONS_TAG,
    operation_id = "Logout",
    summary = "Revoke the current session",
    description = "Blacklists the access token for the rest of its lifetime and revokes its session. \
                   Logging out twice succeeds.",
    responses(
        (status = 204, description = "Logged out"),
        (status = 401, description = "Missing or invalid token", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn logout(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::invalid_token("Missing Authorization header"))?;
    resources
        .sessions
        .logout(token)
        .await
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/sessions",
    tag = SESSIONS_TAG,
    operation_id = "List Sessions",
    summary = "Live sessions of the current user",
    responses(
        (status = 200, description = "Sessions, newest first", body = [SessionInfo]),
        (status = 401, description = "Missing or invalid token", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn list_sessions(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    resources
        .sessions
        .list_user_sessions(&claims.sub)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

#[tracing::instrument(skip(resources, claims))]
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    tag = SESSIONS_TAG,
    operation_id = "Revoke Session",
    summary = "Revoke one of the current user's sessions",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 403, description = "Session belongs to another user", body = ApiError),
        (status = 404, description = "No such session", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn revoke_session(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    resources
        .sessions
        .revoke_session(&claims.sub, &id)
        .await
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/sessions/revoke-others",
    tag = SESSIONS_TAG,
    operation_id = "Revoke Other Sessions",
    summary = "Sign out everywhere else",
    responses(
        (status = 200, description = "Number of sessions revoked", body = RevokedCount),
        (status = 401, description = "Missing or invalid token", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn revoke_other_sessions(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
) -> Result<Json<RevokedCount>, ApiError> {
    let revoked = resources
        .sessions
        .revoke_all_user_sessions(&claims.sub, Some(&claims.sid))
        .await
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))?;
    Ok(Json(RevokedCount { revoked }))
}
