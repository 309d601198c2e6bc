//! Bearer authentication and the JSON error body shared by the HTTP API.

use crate::AppResources;
use crate::error::ServiceError;
use crate::signer::AccessClaims;
use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error body returned by every non-OAuth endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code (e.g., "invalid_token", "not_found")
    pub error: String,
    /// Human-readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ApiError {
    fn new(error: &str, description: Option<String>) -> Self {
        Self {
            error: error.to_string(),
            error_description: description,
        }
    }

    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self::new("invalid_token", Some(description.into()))
    }

    pub fn forbidden(description: impl Into<String>) -> Self {
        Self::new("forbidden", Some(description.into()))
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new("not_found", Some(description.into()))
    }

    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::new("bad_request", Some(description.into()))
    }

    pub fn server_error(description: Option<String>) -> Self {
        Self::new("server_error", description)
    }

    /// Translate a domain error. Internal details are only included when
    /// `expose` is set; they are always logged.
    pub fn from_service(err: ServiceError, expose: bool) -> Self {
        match &err {
            ServiceError::NotFound(_) => Self::not_found(err.to_string()),
            ServiceError::Conflict(_) => Self::new("conflict", Some(err.to_string())),
            ServiceError::InvalidOrExpiredToken | ServiceError::Revoked => {
                Self::invalid_token(err.to_string())
            }
            ServiceError::Forbidden(_) => Self::forbidden(err.to_string()),
            ServiceError::Validation(_) => Self::bad_request(err.to_string()),
            ServiceError::Cancelled => Self::new("unavailable", Some(err.to_string())),
            ServiceError::RetryableConflict(_) | ServiceError::Internal { .. } => {
                tracing::error!(error = ?err, "Request failed");
                Self::server_error(Some(err.public_message(expose)))
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "invalid_token" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "bad_request" => StatusCode::BAD_REQUEST,
            "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum extractor for a first-party session access token.
///
/// # Example
///
/// ```ignore
/// async fn handler(SessionAuth(claims): SessionAuth) -> impl IntoResponse {
///     format!("Hello, {}", claims.sub)
/// }
/// ```
pub struct SessionAuth(pub AccessClaims);

impl<S> FromRequestParts<S> for SessionAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts
            .extensions
            .get::<AppResources>()
            .cloned()
            .ok_or_else(|| {
                tracing::error!("AppResources not found in extensions");
                ApiError::server_error(None)
            })?;

        let token = match parts.headers.get("authorization") {
            None => return Err(ApiError::invalid_token("Missing Authorization header")),
            Some(_) => bearer_token(&parts.headers).ok_or_else(|| {
                ApiError::invalid_token("Authorization header must use Bearer scheme")
            })?,
        };

        resources
            .sessions
            .validate_access_token(token)
            .await
            .map(SessionAuth)
            .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
    }
}
