//! Service-to-service endpoints (/internal/*).
//!
//! When `internal_api_token` is configured every call must present it as a
//! bearer token.

use crate::AppResources;
use crate::api::auth::{ApiError, bearer_token};
use crate::credential::constant_time_eq;
use crate::gateway::{TokenIntrospection, TokenValidation, UserProjection};
use crate::rbac::PermissionCheck;
use axum::{
    Extension, Json,
    extract::{Path, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

pub const INTERNAL_TAG: &str = "Internal";

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(validate_token))
        .routes(routes!(introspect_token))
        .routes(routes!(check_permission))
        .routes(routes!(get_user))
        .layer(axum::middleware::from_fn(require_service_token))
}

async fn require_service_token(request: Request, next: Next) -> Response {
    let Some(resources) = request.extensions().get::<AppResources>() else {
        tracing::error!("AppResources not found in extensions");
        return ApiError::server_error(None).into_response();
    };
    if let Some(expected) = resources.config.internal_api_token.as_deref() {
        let presented = bearer_token(request.headers()).unwrap_or_default();
        if !constant_time_eq(presented, expected) {
            return ApiError::invalid_token("invalid service token").into_response();
        }
    }
    next.run(request).await
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenQuery {
    pub access_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionQuery {
    pub user_id: String,
    pub resource: String,
    pub action: String,
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/validate",
    tag = INTERNAL_TAG,
    operation_id = "Validate Token",
    summary = "Check a session access token",
    request_body = TokenQuery,
    responses((status = 200, description = "Validation result; `valid` is false with an `error` for bad tokens", body = TokenValidation))
)]
pub async fn validate_token(
    Extension(resources): Extension<AppResources>,
    Json(req): Json<TokenQuery>,
) -> Result<Json<TokenValidation>, ApiError> {
    resources
        .gateway
        .validate_token(&req.access_token)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/introspect",
    tag = INTERNAL_TAG,
    operation_id = "Introspect Session Token",
    summary = "Claims and blacklist status of a session access token",
    request_body = TokenQuery,
    responses(
        (status = 200, description = "Token details", body = TokenIntrospection),
        (status = 400, description = "Missing token", body = ApiError),
    )
)]
pub async fn introspect_token(
    Extension(resources): Extension<AppResources>,
    Json(req): Json<TokenQuery>,
) -> Result<Json<TokenIntrospection>, ApiError> {
    resources
        .gateway
        .introspect_token(&req.access_token)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

#[tracing::instrument(skip_all, fields(user_id = %req.user_id, resource = %req.resource, action = %req.action))]
#[utoipa::path(
    post,
    path = "/check-permission",
    tag = INTERNAL_TAG,
    operation_id = "Check Permission",
    summary = "Whether a user may perform an action on a resource",
    request_body = PermissionQuery,
    responses(
        (status = 200, description = "Decision and the granting role", body = PermissionCheck),
        (status = 400, description = "Missing field", body = ApiError),
    )
)]
pub async fn check_permission(
    Extension(resources): Extension<AppResources>,
    Json(req): Json<PermissionQuery>,
) -> Result<Json<PermissionCheck>, ApiError> {
    resources
        .gateway
        .check_permission(&req.user_id, &req.resource, &req.action)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/users/{id}",
    tag = INTERNAL_TAG,
    operation_id = "Get User",
    summary = "User projection with role names",
    params(("id" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "The user", body = UserProjection),
        (status = 404, description = "Unknown user", body = ApiError),
    )
)]
pub async fn get_user(
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
) -> Result<Json<UserProjection>, ApiError> {
    resources
        .gateway
        .get_user(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}
