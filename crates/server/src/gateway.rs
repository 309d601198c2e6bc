//! Service-to-service queries.
//!
//! Other backends holding a user's session access token ask the gateway
//! whether it is still good, who it belongs to and what that user may do.
//! Token problems are answers here, not errors: an invalid token yields
//! `valid: false` with a reason.

use std::sync::Arc;

use sea_orm::{DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::credential::{self, CredentialStore};
use crate::entity::user;
use crate::error::ServiceError;
use crate::rbac::{PermissionCheck, RbacEngine};
use crate::signer::{AccessClaims, SignerError, TokenSigner};

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// First role carried by the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenValidation {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct TokenIntrospection {
    pub active: bool,
    pub blacklisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleInfo {
    pub id: String,
    pub name: String,
    pub display_name: String,
}

/// A user as other services see it. Timestamps are unix seconds.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct UserProjection {
    pub id: String,
    pub email: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email_verified: bool,
    pub is_active: bool,
    pub roles: Vec<RoleInfo>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct Gateway {
    db: Arc<DatabaseConnection>,
    store: CredentialStore,
    signer: Arc<dyn TokenSigner>,
    rbac: RbacEngine,
}

impl Gateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: CredentialStore,
        signer: Arc<dyn TokenSigner>,
        rbac: RbacEngine,
    ) -> Self {
        Self {
            db,
            store,
            signer,
            rbac,
        }
    }

    fn verify(&self, token: &str) -> Result<AccessClaims, String> {
        self.signer.verify_access(token).map_err(|e| match e {
            SignerError::Expired => "token expired".to_string(),
            other => other.to_string(),
        })
    }

    /// Whether `token` is a live session access token of an active user.
    #[tracing::instrument(skip_all)]
    pub async fn validate_token(&self, token: &str) -> Result<TokenValidation, ServiceError> {
        if token.is_empty() {
            return Ok(TokenValidation::invalid("access_token is required"));
        }
        let claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(reason) => {
                tracing::debug!(reason = %reason, "Token validation failed");
                return Ok(TokenValidation::invalid(reason));
            }
        };
        if self.store.is_blacklisted(&credential::hash_token(token)).await? {
            return Ok(TokenValidation::invalid("token is blacklisted"));
        }

        let active = user::Entity::find_by_id(claims.sub.clone())
            .one(self.db.as_ref())
            .await?
            .is_some_and(|u| u.is_active);
        if !active {
            return Ok(TokenValidation::invalid("user is inactive or unknown"));
        }

        Ok(TokenValidation {
            valid: true,
            user_id: Some(claims.sub),
            email: claims.email,
            role: claims.roles.first().cloned(),
            roles: claims.roles,
            expires_at: Some(claims.exp),
            error: None,
        })
    }

    /// Everything the token says about itself, plus whether it has been
    /// blacklisted. A blacklisted token is reported but not active.
    #[tracing::instrument(skip_all)]
    pub async fn introspect_token(&self, token: &str) -> Result<TokenIntrospection, ServiceError> {
        if token.is_empty() {
            return Err(ServiceError::Validation("access_token is required".into()));
        }
        let claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(reason) => {
                return Ok(TokenIntrospection {
                    error: Some(reason),
                    ..TokenIntrospection::default()
                });
            }
        };
        let blacklisted = self.store.is_blacklisted(&credential::hash_token(token)).await?;

        Ok(TokenIntrospection {
            active: !blacklisted,
            blacklisted,
            user_id: Some(claims.sub),
            email: claims.email,
            role: claims.roles.first().cloned(),
            roles: claims.roles,
            session_id: Some(claims.sid),
            issuer: Some(claims.iss),
            issued_at: Some(claims.iat),
            not_before: Some(claims.nbf),
            expires_at: Some(claims.exp),
            error: None,
        })
    }

    pub async fn check_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<PermissionCheck, ServiceError> {
        if user_id.is_empty() {
            return Err(ServiceError::Validation("user_id is required".into()));
        }
        if resource.is_empty() || action.is_empty() {
            return Err(ServiceError::Validation(
                "resource and action are required".into(),
            ));
        }
        self.rbac.check_permission(user_id, resource, action).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user(&self, user_id: &str) -> Result<UserProjection, ServiceError> {
        if user_id.is_empty() {
            return Err(ServiceError::Validation("user_id is required".into()));
        }
        let found = user::Entity::find_by_id(user_id.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound("user not found".into()))?;
        let roles = self
            .rbac
            .get_user_roles(user_id)
            .await?
            .into_iter()
            .map(|r| RoleInfo {
                id: r.id,
                name: r.name,
                display_name: r.display_name,
            })
            .collect();

        Ok(UserProjection {
            id: found.id,
            email: found.email,
            username: found.username,
            full_name: found.full_name,
            email_verified: found.email_verified,
            is_active: found.is_active,
            roles,
            created_at: found.created_at.unix_timestamp(),
            updated_at: found.updated_at.unix_timestamp(),
        })
    }
}
