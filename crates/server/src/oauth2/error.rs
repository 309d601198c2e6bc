use axum::http::StatusCode;
use thiserror::Error;

use crate::error::ServiceError;

/// Protocol-level failure, carrying the RFC 6749 / 8628 error code.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client: {0}")]
    InvalidClient(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("invalid_token: {0}")]
    InvalidToken(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("access_denied: {0}")]
    AccessDenied(String),
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),
    #[error("unsupported_response_type: {0}")]
    UnsupportedResponseType(String),
    #[error("consent_required")]
    ConsentRequired,
    #[error("login_required")]
    LoginRequired,
    #[error("authorization_pending")]
    AuthorizationPending,
    #[error("slow_down")]
    SlowDown,
    #[error("expired_token")]
    ExpiredToken,
    #[error("temporarily_unavailable: rate limit exceeded")]
    RateLimited,
    #[error("server_error: {0}")]
    ServerError(ServiceError),
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::AccessDenied(_) => "access_denied",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType(_) => "unsupported_response_type",
            OAuthError::ConsentRequired => "consent_required",
            OAuthError::LoginRequired => "login_required",
            OAuthError::AuthorizationPending => "authorization_pending",
            OAuthError::SlowDown => "slow_down",
            OAuthError::ExpiredToken => "expired_token",
            OAuthError::RateLimited => "temporarily_unavailable",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient(_) | OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::LoginRequired => StatusCode::UNAUTHORIZED,
            OAuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// `error_description` for the response body. Server errors only carry
    /// details when `expose` is set.
    pub fn description(&self, expose: bool) -> Option<String> {
        match self {
            OAuthError::InvalidRequest(d)
            | OAuthError::InvalidClient(d)
            | OAuthError::InvalidGrant(d)
            | OAuthError::InvalidScope(d)
            | OAuthError::InvalidToken(d)
            | OAuthError::UnauthorizedClient(d)
            | OAuthError::AccessDenied(d)
            | OAuthError::UnsupportedGrantType(d)
            | OAuthError::UnsupportedResponseType(d) => Some(d.clone()),
            OAuthError::ServerError(e) => Some(e.public_message(expose)),
            _ => None,
        }
    }
}

impl From<ServiceError> for OAuthError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => OAuthError::InvalidGrant(format!("{what} not found")),
            ServiceError::InvalidOrExpiredToken => {
                OAuthError::InvalidGrant("token is invalid or expired".into())
            }
            ServiceError::Revoked => OAuthError::InvalidGrant("token has been revoked".into()),
            ServiceError::Validation(msg) => OAuthError::InvalidRequest(msg),
            ServiceError::Forbidden(msg) => OAuthError::AccessDenied(msg),
            other => OAuthError::ServerError(other),
        }
    }
}
