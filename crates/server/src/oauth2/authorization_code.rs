//! Authorization Code grant with PKCE.

use sea_orm::{ActiveModelTrait, ActiveValue::Set};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use super::grants::required;
use super::pkce::{self, ChallengeMethod};
use super::{GRANT_AUTHORIZATION_CODE, OAuthError, OAuthServer, TokenRequest, TokenResponse, scope};
use crate::credential;
use crate::entity::oauth2_authorization;
use crate::error::ServiceError;

/// OAuth2 authorization request parameters.
#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Must be "code"
    pub response_type: String,
    pub client_id: String,
    /// Must exactly match a registered redirect URI
    pub redirect_uri: Option<String>,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value returned unchanged in the redirect
    pub state: Option<String>,
    /// Replay protection, echoed in the ID token
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    /// "S256" or "plain". Absent means plain.
    pub code_challenge_method: Option<String>,
}

/// An issued code and where to send it.
#[derive(Clone, Debug)]
pub struct AuthorizationGrant {
    pub code: String,
    pub state: Option<String>,
    pub redirect_uri: String,
}

impl AuthorizationGrant {
    /// `redirect_uri?code=...&state=...`
    pub fn redirect_url(&self) -> Result<String, ServiceError> {
        let mut url = url::Url::parse(&self.redirect_uri)
            .map_err(|e| ServiceError::Validation(format!("invalid redirect URI: {e}")))?;
        url.query_pairs_mut().append_pair("code", &self.code);
        if let Some(state) = &self.state {
            url.query_pairs_mut().append_pair("state", state);
        }
        Ok(url.into())
    }
}

impl OAuthServer {
    /// Issue an authorization code to `user_id` for the requesting client.
    #[tracing::instrument(skip(self, req), fields(client_id = %req.client_id))]
    pub async fn authorize(
        &self,
        user_id: &str,
        req: AuthorizeRequest,
    ) -> Result<AuthorizationGrant, OAuthError> {
        let client = self.active_client(&req.client_id).await?;

        let redirect_uri = required(&req.redirect_uri, "redirect_uri")?;
        if !client.is_redirect_uri_allowed(redirect_uri) {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri is not registered for this client".into(),
            ));
        }
        if req.response_type != "code" {
            return Err(OAuthError::UnsupportedResponseType(
                "only 'code' is supported".into(),
            ));
        }
        if !client.is_grant_type_allowed(GRANT_AUTHORIZATION_CODE) {
            return Err(OAuthError::UnauthorizedClient(
                "client is not allowed to use authorization_code".into(),
            ));
        }

        let scopes = scope::resolve_scopes(&client, req.scope.as_deref())?;

        let challenge = req.code_challenge.as_deref().filter(|c| !c.is_empty());
        let method = match challenge {
            Some(c) => {
                let method: ChallengeMethod = req
                    .code_challenge_method
                    .as_deref()
                    .unwrap_or("plain")
                    .parse()
                    .map_err(OAuthError::InvalidRequest)?;
                if method == ChallengeMethod::Plain && !self.config.allow_plain_pkce {
                    return Err(OAuthError::InvalidRequest(
                        "code_challenge_method must be S256".into(),
                    ));
                }
                if c.len() < 43 || c.len() > 128 {
                    return Err(OAuthError::InvalidRequest(
                        "code_challenge has an invalid length".into(),
                    ));
                }
                Some(method)
            }
            None if client.pkce_required() => {
                return Err(OAuthError::InvalidRequest(
                    "code_challenge is required for this client".into(),
                ));
            }
            None => None,
        };

        if client.needs_consent() && !self.has_consent(user_id, &client.id, &scopes).await? {
            return Err(OAuthError::ConsentRequired);
        }

        let code = credential::issue()?;
        let now = OffsetDateTime::now_utc();
        let row = oauth2_authorization::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            code_hash: Set(code.hash),
            client_id: Set(client.id.clone()),
            user_id: Set(user_id.to_string()),
            redirect_uri: Set(redirect_uri.to_string()),
            scope: Set(scope::join_scopes(&scopes)),
            nonce: Set(req.nonce.clone().filter(|n| !n.is_empty())),
            code_challenge: Set(challenge.map(String::from)),
            code_challenge_method: Set(method.map(|m| m.as_str().to_string())),
            used: Set(false),
            expires_at: Set(now + Duration::seconds(self.config.authorization_code_ttl)),
            created_at: Set(now),
        };
        let db = self.db.as_ref();
        self.coordinator
            .run("issue_authorization_code", || {
                let row = row.clone();
                async move { row.insert(db).await.map_err(ServiceError::from) }
            })
            .await?;

        tracing::info!(user_id, client_id = %client.client_id, "Authorization code issued");
        Ok(AuthorizationGrant {
            code: code.plaintext,
            state: req.state,
            redirect_uri: redirect_uri.to_string(),
        })
    }

    /// Redeem an authorization code. Exactly one exchange per code succeeds.
    pub async fn exchange_authorization_code(
        &self,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let code = required(&req.code, "code")?;
        let redirect_uri = required(&req.redirect_uri, "redirect_uri")?;

        let record = match self
            .store
            .find_authorization_code(self.db.as_ref(), &credential::hash_token(code))
            .await
        {
            Ok(record) => record,
            Err(ServiceError::NotFound(_)) => {
                return Err(OAuthError::InvalidGrant("invalid authorization code".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if record.used {
            return Err(OAuthError::InvalidGrant(
                "authorization code already used".into(),
            ));
        }
        if record.is_expired() {
            return Err(OAuthError::InvalidGrant("authorization code expired".into()));
        }

        let client = self
            .authenticate_client(req.client_id.as_deref(), req.client_secret.as_deref())
            .await?;
        if record.client_id != client.id {
            return Err(OAuthError::InvalidGrant(
                "authorization code was not issued to this client".into(),
            ));
        }
        if record.redirect_uri != redirect_uri {
            return Err(OAuthError::InvalidGrant("redirect_uri mismatch".into()));
        }

        let verifier = req.code_verifier.as_deref().filter(|v| !v.is_empty());
        match (record.code_challenge.as_deref(), verifier) {
            (Some(challenge), Some(verifier)) => {
                let method = record
                    .code_challenge_method
                    .as_deref()
                    .unwrap_or("plain")
                    .parse()
                    .unwrap_or(ChallengeMethod::S256);
                if !pkce::verify(verifier, challenge, method) {
                    tracing::warn!(client_id = %client.client_id, "PKCE verification failed");
                    return Err(OAuthError::InvalidGrant("code_verifier mismatch".into()));
                }
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidGrant("code_verifier is required".into()));
            }
            (None, _) if client.pkce_required() => {
                return Err(OAuthError::InvalidGrant(
                    "code was issued without a PKCE challenge".into(),
                ));
            }
            (None, _) => {}
        }

        let scopes = scope::parse_scopes(Some(&record.scope));
        let issuer = self.token_issuer();
        let store = self.store.clone();
        let issued = self
            .coordinator
            .in_transaction(self.db.as_ref(), "exchange_authorization_code", |txn| {
                let issuer = issuer.clone();
                let store = store.clone();
                let client = client.clone();
                let record = record.clone();
                let scopes = scopes.clone();
                Box::pin(async move {
                    if !store.claim_authorization_code(txn, &record.id).await? {
                        return Ok(None);
                    }
                    let issued = issuer
                        .issue(
                            txn,
                            &client,
                            Some(&record.user_id),
                            &scopes,
                            record.nonce.as_deref(),
                        )
                        .await?;
                    Ok(Some(issued))
                })
            })
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("authorization code already used".into()))?;

        self.link_session(&issued).await;
        Ok(issued.response)
    }
}
