//! Token endpoint: grant dispatch, token issuance, client credentials and
//! refresh rotation.

use std::sync::Arc;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, ConnectionTrait, EntityTrait};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use super::scope::{self, SCOPE_EMAIL, SCOPE_OPENID, SCOPE_PROFILE};
use super::{OAuthError, OAuthServer};
use crate::credential;
use crate::entity::{oauth2_access_token, oauth2_client, oauth2_refresh_token, user};
use crate::error::ServiceError;
use crate::session::{SessionCreationParams, SessionMetadata, SessionRefreshParams};
use crate::signer::{IdTokenClaims, TokenSigner};

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";

pub(super) const KNOWN_GRANT_TYPES: [&str; 4] = [
    GRANT_AUTHORIZATION_CODE,
    GRANT_REFRESH_TOKEN,
    GRANT_CLIENT_CREDENTIALS,
    GRANT_DEVICE_CODE,
];

/// Form body of `POST /oauth2/token`. Which fields matter depends on
/// `grant_type`.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub code_verifier: Option<String>,
    pub device_code: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Result of a token-issuing transaction, with what session linking needs.
pub(super) struct IssuedTokens {
    pub response: TokenResponse,
    pub client_id: String,
    pub user_id: Option<String>,
    pub access_hash: String,
    pub refresh: Option<(String, OffsetDateTime)>,
}

/// The part of the server a transaction body needs to mint tokens. Owned so
/// it can move into the transaction future.
#[derive(Clone)]
pub(super) struct TokenIssuer {
    signer: Arc<dyn TokenSigner>,
    issuer: String,
}

impl TokenIssuer {
    /// Store an access token, plus a refresh token when there is a user and
    /// the client may refresh, plus an ID token when `openid` was granted.
    pub async fn issue<C: ConnectionTrait>(
        &self,
        conn: &C,
        client: &oauth2_client::Model,
        user_id: Option<&str>,
        scopes: &[String],
        nonce: Option<&str>,
    ) -> Result<IssuedTokens, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let scope = scope::join_scopes(scopes);

        let user = match user_id {
            Some(id) => match user::Entity::find_by_id(id.to_string()).one(conn).await? {
                Some(u) if !u.is_active => {
                    return Err(ServiceError::Forbidden("user is inactive".into()));
                }
                found => found,
            },
            None => None,
        };

        let access = credential::issue()?;
        let access_id = uuid::Uuid::new_v4().to_string();
        oauth2_access_token::ActiveModel {
            id: Set(access_id.clone()),
            token_hash: Set(access.hash.clone()),
            client_id: Set(client.id.clone()),
            user_id: Set(user_id.map(String::from)),
            scope: Set(scope.clone()),
            expires_at: Set(now + Duration::seconds(client.access_token_ttl)),
            revoked_at: Set(None),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;

        let refresh = match user_id {
            Some(uid) if client.is_grant_type_allowed(GRANT_REFRESH_TOKEN) => {
                let secret = credential::issue()?;
                let expires_at = now + Duration::seconds(client.refresh_token_ttl);
                oauth2_refresh_token::ActiveModel {
                    id: Set(uuid::Uuid::new_v4().to_string()),
                    token_hash: Set(secret.hash.clone()),
                    access_token_id: Set(access_id),
                    client_id: Set(client.id.clone()),
                    user_id: Set(Some(uid.to_string())),
                    scope: Set(scope.clone()),
                    expires_at: Set(expires_at),
                    revoked_at: Set(None),
                    created_at: Set(now),
                }
                .insert(conn)
                .await?;
                Some((secret, expires_at))
            }
            _ => None,
        };

        let id_token = match &user {
            Some(u) if scopes.iter().any(|s| s == SCOPE_OPENID) => {
                Some(self.sign_id_token(client, u, scopes, nonce, now)?)
            }
            _ => None,
        };

        tracing::info!(
            client_id = %client.client_id,
            user_id = user_id.unwrap_or("-"),
            scope = %scope,
            refresh = refresh.is_some(),
            "OAuth tokens issued"
        );

        Ok(IssuedTokens {
            response: TokenResponse {
                access_token: access.plaintext,
                token_type: "Bearer".to_string(),
                expires_in: client.access_token_ttl,
                refresh_token: refresh.as_ref().map(|(s, _)| s.plaintext.clone()),
                id_token,
                scope: (!scope.is_empty()).then_some(scope),
            },
            client_id: client.client_id.clone(),
            user_id: user_id.map(String::from),
            access_hash: access.hash,
            refresh: refresh.map(|(s, exp)| (s.hash, exp)),
        })
    }

    fn sign_id_token(
        &self,
        client: &oauth2_client::Model,
        user: &user::Model,
        scopes: &[String],
        nonce: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<String, ServiceError> {
        let granted = |s: &str| scopes.iter().any(|x| x == s);
        let claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: user.id.clone(),
            aud: client.client_id.clone(),
            exp: (now + Duration::seconds(client.id_token_ttl)).unix_timestamp(),
            iat: now.unix_timestamp(),
            nonce: nonce.filter(|n| !n.is_empty()).map(String::from),
            email: granted(SCOPE_EMAIL).then(|| user.email.clone()),
            email_verified: granted(SCOPE_EMAIL).then_some(user.email_verified),
            name: granted(SCOPE_PROFILE)
                .then(|| user.full_name.clone())
                .flatten(),
            preferred_username: granted(SCOPE_PROFILE)
                .then(|| user.username.clone())
                .flatten(),
        };
        self.signer
            .sign_id_token(&claims)
            .map_err(|e| ServiceError::internal_with("failed to sign ID token", e))
    }
}

pub(super) fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest(format!("{name} is required")))
}

impl OAuthServer {
    pub(super) fn token_issuer(&self) -> TokenIssuer {
        TokenIssuer {
            signer: self.signer.clone(),
            issuer: self.issuer.clone(),
        }
    }

    /// `POST /oauth2/token`.
    #[tracing::instrument(skip_all, fields(grant_type = %req.grant_type))]
    pub async fn token(&self, req: &TokenRequest) -> Result<TokenResponse, OAuthError> {
        match req.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => self.exchange_authorization_code(req).await,
            GRANT_REFRESH_TOKEN => self.refresh_token_grant(req).await,
            GRANT_CLIENT_CREDENTIALS => self.client_credentials_grant(req).await,
            GRANT_DEVICE_CODE => self.poll_device_token(req).await,
            "" => Err(OAuthError::InvalidRequest("grant_type is required".into())),
            other => Err(OAuthError::UnsupportedGrantType(format!(
                "grant type '{other}' is not supported"
            ))),
        }
    }

    /// Machine-to-machine tokens. No user, no refresh token.
    pub async fn client_credentials_grant(
        &self,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        if req.client_secret.is_none() {
            return Err(OAuthError::InvalidClient(
                "client authentication required".into(),
            ));
        }
        let client = self
            .authenticate_client(req.client_id.as_deref(), req.client_secret.as_deref())
            .await?;
        if client.is_public() || !client.is_grant_type_allowed(GRANT_CLIENT_CREDENTIALS) {
            return Err(OAuthError::UnauthorizedClient(
                "client is not allowed to use client_credentials".into(),
            ));
        }
        let scopes = scope::resolve_scopes(&client, req.scope.as_deref())?;

        let issuer = self.token_issuer();
        let issued = self
            .coordinator
            .in_transaction(self.db.as_ref(), "client_credentials_grant", |txn| {
                let issuer = issuer.clone();
                let client = client.clone();
                let scopes = scopes.clone();
                Box::pin(async move { issuer.issue(txn, &client, None, &scopes, None).await })
            })
            .await?;
        Ok(issued.response)
    }

    /// Exchange a refresh token for a new pair. The presented token is revoked
    /// in the same transaction, so a second use fails with `invalid_grant`.
    pub async fn refresh_token_grant(
        &self,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let refresh_token = required(&req.refresh_token, "refresh_token")?;
        let client = self
            .authenticate_client(req.client_id.as_deref(), req.client_secret.as_deref())
            .await?;
        if !client.is_grant_type_allowed(GRANT_REFRESH_TOKEN) {
            return Err(OAuthError::UnauthorizedClient(
                "client is not allowed to use refresh_token".into(),
            ));
        }

        let old_hash = credential::hash_token(refresh_token);
        let existing = match self.store.find_refresh_token(self.db.as_ref(), &old_hash).await {
            Ok(token) => token,
            Err(ServiceError::NotFound(_)) => {
                return Err(OAuthError::InvalidGrant("invalid refresh token".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if existing.client_id != client.id {
            return Err(OAuthError::InvalidGrant(
                "refresh token was not issued to this client".into(),
            ));
        }
        if !existing.is_valid() {
            return Err(OAuthError::InvalidGrant(
                "refresh token is expired or revoked".into(),
            ));
        }

        let original = scope::parse_scopes(Some(&existing.scope));
        let requested = scope::parse_scopes(req.scope.as_deref());
        let scopes = if requested.is_empty() {
            original
        } else {
            scope::validate_scopes(&requested, &original)?;
            requested
        };

        let issuer = self.token_issuer();
        let store = self.store.clone();
        let issued = self
            .coordinator
            .in_transaction(self.db.as_ref(), "refresh_token_grant", |txn| {
                let issuer = issuer.clone();
                let store = store.clone();
                let client = client.clone();
                let scopes = scopes.clone();
                let old_hash = old_hash.clone();
                let access_token_id = existing.access_token_id.clone();
                let user_id = existing.user_id.clone();
                Box::pin(async move {
                    if !store.claim_refresh_token(txn, &old_hash).await? {
                        return Ok(None);
                    }
                    store.revoke_access_token_by_id(txn, &access_token_id).await?;
                    let issued = issuer
                        .issue(txn, &client, user_id.as_deref(), &scopes, None)
                        .await?;
                    Ok(Some(issued))
                })
            })
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("refresh token already used".into()))?;

        self.rotate_linked_session(&old_hash, &issued).await;
        Ok(issued.response)
    }

    /// Record a first-party session for tokens issued to a user. Failure only
    /// costs the session listing, so it is logged and swallowed.
    pub(super) async fn link_session(&self, issued: &IssuedTokens) {
        if !self.config.link_sessions {
            return;
        }
        let (Some(user_id), Some((refresh_hash, expires_at))) = (&issued.user_id, &issued.refresh)
        else {
            return;
        };
        let params = SessionCreationParams {
            user_id: user_id.clone(),
            client_id: Some(issued.client_id.clone()),
            token_hash: refresh_hash.clone(),
            access_token_hash: Some(issued.access_hash.clone()),
            expires_at: *expires_at,
            metadata: SessionMetadata {
                session_name: Some(format!("oauth:{}", issued.client_id)),
                ..Default::default()
            },
        };
        if let Err(e) = self
            .sessions
            .create_session_with_params(self.db.as_ref(), None, params)
            .await
        {
            tracing::warn!(error = %e, user_id = %user_id, client_id = %issued.client_id, "Failed to link session");
        }
    }

    async fn rotate_linked_session(&self, old_hash: &str, issued: &IssuedTokens) {
        if !self.config.link_sessions {
            return;
        }
        let Some((new_hash, expires_at)) = &issued.refresh else {
            return;
        };
        let params = SessionRefreshParams {
            client_id: Some(issued.client_id.clone()),
            old_token_hash: old_hash.to_string(),
            new_token_hash: new_hash.clone(),
            new_access_token_hash: Some(issued.access_hash.clone()),
            new_expires_at: *expires_at,
        };
        match self.sessions.refresh_session_tokens(params).await {
            Ok(()) => {}
            Err(ServiceError::NotFound(_)) => {
                tracing::debug!(client_id = %issued.client_id, "No linked session to rotate");
            }
            Err(e) => {
                tracing::warn!(error = %e, client_id = %issued.client_id, "Failed to rotate linked session");
            }
        }
    }
}
