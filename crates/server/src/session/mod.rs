//! First-party sessions.
//!
//! A session pairs a short-lived signed access token with a long-lived opaque
//! refresh token. Refreshing rotates both in place with a single conditional
//! update, so a refresh token can be used at most once.

mod manager;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

pub use manager::SessionManager;

use crate::error::ServiceError;

/// Where a session was created from.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SessionCreationParams {
    pub user_id: String,
    /// Set when the session mirrors an OAuth grant
    pub client_id: Option<String>,
    /// Hash of the refresh token
    pub token_hash: String,
    pub access_token_hash: Option<String>,
    pub expires_at: OffsetDateTime,
    pub metadata: SessionMetadata,
}

impl SessionCreationParams {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.user_id.is_empty() {
            return Err(ServiceError::Validation("user_id is required".into()));
        }
        if self.token_hash.is_empty() {
            return Err(ServiceError::Validation("token_hash is required".into()));
        }
        if self.expires_at <= OffsetDateTime::now_utc() {
            return Err(ServiceError::Validation(
                "expires_at must be in the future".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SessionRefreshParams {
    /// Only a session of the same origin is rotated
    pub client_id: Option<String>,
    pub old_token_hash: String,
    pub new_token_hash: String,
    pub new_access_token_hash: Option<String>,
    pub new_expires_at: OffsetDateTime,
}

impl SessionRefreshParams {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.old_token_hash.is_empty() {
            return Err(ServiceError::Validation(
                "old_token_hash is required".into(),
            ));
        }
        if self.new_token_hash.is_empty() {
            return Err(ServiceError::Validation(
                "new_token_hash is required".into(),
            ));
        }
        if self.new_expires_at <= OffsetDateTime::now_utc() {
            return Err(ServiceError::Validation(
                "new_expires_at must be in the future".into(),
            ));
        }
        Ok(())
    }
}

/// Token pair handed to the client after login or refresh.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub session_id: String,
}

/// Session as shown to its owner. Timestamps are unix seconds.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct SessionInfo {
    pub id: String,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_name: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
    pub expires_at: i64,
}

impl From<crate::entity::session::Model> for SessionInfo {
    fn from(s: crate::entity::session::Model) -> Self {
        Self {
            id: s.id,
            client_id: s.client_id,
            ip_address: s.ip_address,
            user_agent: s.user_agent,
            session_name: s.session_name,
            created_at: s.created_at.unix_timestamp(),
            last_active_at: s.last_active_at.unix_timestamp(),
            expires_at: s.expires_at.unix_timestamp(),
        }
    }
}
