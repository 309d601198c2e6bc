//! Introspection (RFC 7662), revocation (RFC 7009) and UserInfo.

use sea_orm::EntityTrait;
use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

use super::scope::{SCOPE_EMAIL, SCOPE_PROFILE};
use super::{OAuthError, OAuthServer};
use crate::credential;
use crate::entity::{oauth2_client, user};
use crate::error::ServiceError;

const HINT_REFRESH_TOKEN: &str = "refresh_token";

#[derive(Clone, Debug, Default, Serialize, ToSchema)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct UserInfo {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// The fields introspection reports, common to both token kinds.
struct LiveToken {
    token_type: &'static str,
    scope: String,
    client_internal_id: String,
    user_id: Option<String>,
    expires_at: OffsetDateTime,
    issued_at: OffsetDateTime,
}

impl OAuthServer {
    /// Report whether `token` is currently usable. Unknown, expired, revoked
    /// and blacklisted tokens are all simply inactive.
    #[tracing::instrument(skip_all)]
    pub async fn introspect(&self, token: &str, hint: Option<&str>) -> IntrospectionResponse {
        self.introspect_as(None, token, hint).await
    }

    /// Introspection on behalf of an authenticated client. Tokens issued to
    /// other clients are reported inactive.
    #[tracing::instrument(skip_all, fields(client_id = %client.client_id))]
    pub async fn introspect_for_client(
        &self,
        client: &oauth2_client::Model,
        token: &str,
        hint: Option<&str>,
    ) -> IntrospectionResponse {
        self.introspect_as(Some(&client.id), token, hint).await
    }

    async fn introspect_as(
        &self,
        owner: Option<&str>,
        token: &str,
        hint: Option<&str>,
    ) -> IntrospectionResponse {
        match self.find_live_token(token, hint).await {
            Ok(Some(live)) if owner.is_some_and(|o| o != live.client_internal_id) => {
                tracing::debug!("Introspection of another client's token");
                IntrospectionResponse::inactive()
            }
            Ok(Some(live)) => self.describe(live).await,
            Ok(None) => IntrospectionResponse::inactive(),
            Err(e) => {
                tracing::error!(error = %e, "Introspection lookup failed");
                IntrospectionResponse::inactive()
            }
        }
    }

    async fn find_live_token(
        &self,
        token: &str,
        hint: Option<&str>,
    ) -> Result<Option<LiveToken>, ServiceError> {
        let hash = credential::hash_token(token);
        if self.store.is_blacklisted(&hash).await? {
            return Ok(None);
        }
        let refresh_first = hint == Some(HINT_REFRESH_TOKEN);
        for refresh in [refresh_first, !refresh_first] {
            let found = if refresh {
                self.store
                    .find_refresh_token(self.db.as_ref(), &hash)
                    .await
                    .map(|t| {
                        t.is_valid().then(|| LiveToken {
                            token_type: HINT_REFRESH_TOKEN,
                            scope: t.scope,
                            client_internal_id: t.client_id,
                            user_id: t.user_id,
                            expires_at: t.expires_at,
                            issued_at: t.created_at,
                        })
                    })
            } else {
                self.store
                    .find_access_token(self.db.as_ref(), &hash)
                    .await
                    .map(|t| {
                        t.is_valid().then(|| LiveToken {
                            token_type: "Bearer",
                            scope: t.scope,
                            client_internal_id: t.client_id,
                            user_id: t.user_id,
                            expires_at: t.expires_at,
                            issued_at: t.created_at,
                        })
                    })
            };
            match found {
                Ok(live) => return Ok(live),
                Err(ServiceError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn describe(&self, live: LiveToken) -> IntrospectionResponse {
        let client_id = match oauth2_client::Entity::find_by_id(live.client_internal_id)
            .one(self.db.as_ref())
            .await
        {
            Ok(client) => client.map(|c| c.client_id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load client for introspection");
                None
            }
        };
        let username = match &live.user_id {
            Some(id) => match user::Entity::find_by_id(id.clone()).one(self.db.as_ref()).await {
                Ok(u) => u.map(|u| u.username.unwrap_or(u.email)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load user for introspection");
                    None
                }
            },
            None => None,
        };

        IntrospectionResponse {
            active: true,
            scope: Some(live.scope),
            client_id,
            username,
            token_type: Some(live.token_type.to_string()),
            exp: Some(live.expires_at.unix_timestamp()),
            iat: Some(live.issued_at.unix_timestamp()),
            nbf: Some(live.issued_at.unix_timestamp()),
            sub: live.user_id,
            iss: Some(self.issuer.clone()),
        }
    }

    /// Revoke an access or refresh token. Unknown and already revoked tokens
    /// are not an error. A refresh token takes its access token and linked
    /// session with it.
    #[tracing::instrument(skip_all)]
    pub async fn revoke_token(&self, token: &str, hint: Option<&str>) -> Result<(), ServiceError> {
        self.revoke_as(None, token, hint).await
    }

    /// Revocation on behalf of an authenticated client. Tokens issued to other
    /// clients are left alone and the request still succeeds.
    #[tracing::instrument(skip_all, fields(client_id = %client.client_id))]
    pub async fn revoke_token_for_client(
        &self,
        client: &oauth2_client::Model,
        token: &str,
        hint: Option<&str>,
    ) -> Result<(), ServiceError> {
        self.revoke_as(Some(&client.id), token, hint).await
    }

    async fn revoke_as(
        &self,
        owner: Option<&str>,
        token: &str,
        hint: Option<&str>,
    ) -> Result<(), ServiceError> {
        let hash = credential::hash_token(token);
        let refresh_first = hint == Some(HINT_REFRESH_TOKEN);
        let store = self.store.clone();
        let owner = owner.map(String::from);
        // Some(true) for a refresh token, Some(false) for an access token.
        let matched = self
            .coordinator
            .in_transaction(self.db.as_ref(), "revoke_token", |txn| {
                let store = store.clone();
                let hash = hash.clone();
                let owner = owner.clone();
                Box::pin(async move {
                    for refresh in [refresh_first, !refresh_first] {
                        let holder = if refresh {
                            store.find_refresh_token(txn, &hash).await.map(|t| t.client_id)
                        } else {
                            store.find_access_token(txn, &hash).await.map(|t| t.client_id)
                        };
                        let holder = match holder {
                            Ok(holder) => holder,
                            Err(ServiceError::NotFound(_)) => continue,
                            Err(e) => return Err(e),
                        };
                        if owner.as_deref().is_some_and(|o| o != holder) {
                            return Ok(None);
                        }
                        if refresh {
                            store.revoke_refresh_token(txn, &hash).await?;
                        } else {
                            store.revoke_access_token(txn, &hash).await?;
                        }
                        return Ok(Some(refresh));
                    }
                    Ok(None)
                })
            })
            .await?;

        match matched {
            Some(true) => {
                self.sessions.revoke_session_by_token_hash(&hash).await?;
                tracing::info!(token_type = HINT_REFRESH_TOKEN, "Token revoked");
            }
            Some(false) => tracing::info!(token_type = "access_token", "Token revoked"),
            None => tracing::debug!("Revocation ignored for unknown or foreign token"),
        }
        Ok(())
    }

    /// OpenID Connect UserInfo for a bearer OAuth access token. Claims beyond
    /// `sub` depend on the token's scopes.
    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo, OAuthError> {
        let hash = credential::hash_token(access_token);
        let token = match self.store.find_access_token(self.db.as_ref(), &hash).await {
            Ok(token) if token.is_valid() => token,
            Ok(_) | Err(ServiceError::NotFound(_)) => {
                return Err(OAuthError::InvalidToken(
                    "access token is invalid or expired".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if self.store.is_blacklisted(&hash).await? {
            return Err(OAuthError::InvalidToken("access token has been revoked".into()));
        }
        let user_id = token
            .user_id
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidToken("token has no associated user".into()))?;
        let user = user::Entity::find_by_id(user_id.to_string())
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::from)?
            .ok_or_else(|| OAuthError::InvalidToken("user no longer exists".into()))?;

        let mut info = UserInfo {
            sub: user.id.clone(),
            email: None,
            email_verified: None,
            name: None,
            preferred_username: None,
            updated_at: None,
        };
        if token.has_scope(SCOPE_PROFILE) {
            info.name = user.full_name;
            info.preferred_username = user.username;
            info.updated_at = Some(user.updated_at.unix_timestamp());
        }
        if token.has_scope(SCOPE_EMAIL) {
            info.email = Some(user.email);
            info.email_verified = Some(user.email_verified);
        }
        Ok(info)
    }
}
