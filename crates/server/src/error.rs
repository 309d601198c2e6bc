use sea_orm::DbErr;
use thiserror::Error;

use crate::consistency::{DbErrorKind, classify_db_err};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Domain error shared by every core service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,
    #[error("token has been revoked")]
    Revoked,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("retryable conflict: {0}")]
    RetryableConflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ServiceError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the consistency coordinator should run the unit of work again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::RetryableConflict(_))
    }

    /// Message safe to hand to a caller. Internal details are only included
    /// when `expose` is set.
    pub fn public_message(&self, expose: bool) -> String {
        match self {
            ServiceError::Internal { message, source } => {
                if !expose {
                    return "internal server error".to_string();
                }
                match source {
                    Some(src) => format!("{message}: {src}"),
                    None => message.clone(),
                }
            }
            ServiceError::RetryableConflict(_) if !expose => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        match classify_db_err(&err) {
            DbErrorKind::Retryable => ServiceError::RetryableConflict(err.to_string()),
            DbErrorKind::UniqueViolation => ServiceError::Conflict(err.to_string()),
            DbErrorKind::NotFound => ServiceError::NotFound(err.to_string()),
            DbErrorKind::Other => ServiceError::internal_with("database error", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retryable_conflicts_are_retryable() {
        assert!(ServiceError::RetryableConflict("x".into()).is_retryable());
        assert!(!ServiceError::Conflict("x".into()).is_retryable());
        assert!(!ServiceError::internal("x").is_retryable());
        assert!(!ServiceError::Cancelled.is_retryable());
    }

    #[test]
    fn internal_details_hidden_unless_exposed() {
        let err = ServiceError::internal_with(
            "refresh failed",
            std::io::Error::other("connection reset"),
        );
        assert_eq!(err.public_message(false), "internal server error");
        assert_eq!(
            err.public_message(true),
            "refresh failed: connection reset"
        );
    }

    #[test]
    fn client_errors_always_carry_their_message() {
        let err = ServiceError::Forbidden("session belongs to another user".into());
        assert_eq!(
            err.public_message(false),
            "forbidden: session belongs to another user"
        );
    }

    #[test]
    fn record_not_found_maps_to_not_found() {
        let err: ServiceError = DbErr::RecordNotFound("role".into()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
