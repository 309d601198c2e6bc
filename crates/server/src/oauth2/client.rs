//! Client registry.

use base64::Engine;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

use super::grants::KNOWN_GRANT_TYPES;
use super::{GRANT_CLIENT_CREDENTIALS, OAuthError, OAuthServer};
use crate::credential::{self, constant_time_eq, random_bytes};
use crate::entity::oauth2_client::{self, CLIENT_TYPE_CONFIDENTIAL, CLIENT_TYPE_PUBLIC};
use crate::error::ServiceError;

const CLIENT_ID_PREFIX: &str = "agw_";
const CLIENT_SECRET_PREFIX: &str = "agws_";

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct CreateClient {
    pub name: String,
    /// "public" or "confidential"
    pub client_type: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub allowed_scopes: Vec<String>,
    #[serde(default)]
    pub default_scopes: Vec<String>,
    #[serde(default)]
    pub require_pkce: bool,
    #[serde(default = "default_true")]
    pub require_consent: bool,
    #[serde(default)]
    pub first_party: bool,
    pub access_token_ttl: Option<i64>,
    pub refresh_token_ttl: Option<i64>,
    pub id_token_ttl: Option<i64>,
    pub owner_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A stored client plus its secret, which is only ever shown here.
#[derive(Clone, Serialize, ToSchema)]
pub struct RegisteredClient {
    #[schema(value_type = Object)]
    pub client: oauth2_client::Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

fn new_client_id() -> Result<String, ServiceError> {
    let bytes = random_bytes::<16>()?;
    Ok(format!(
        "{CLIENT_ID_PREFIX}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    ))
}

fn new_client_secret() -> Result<String, ServiceError> {
    Ok(format!("{CLIENT_SECRET_PREFIX}{}", credential::generate_token()?))
}

impl CreateClient {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.name.trim().is_empty() {
            return Err(ServiceError::Validation("client name is required".into()));
        }
        if self.client_type != CLIENT_TYPE_PUBLIC && self.client_type != CLIENT_TYPE_CONFIDENTIAL {
            return Err(ServiceError::Validation(format!(
                "unknown client type '{}'",
                self.client_type
            )));
        }
        if self.grant_types.is_empty() {
            return Err(ServiceError::Validation(
                "at least one grant type is required".into(),
            ));
        }
        if let Some(unknown) = self
            .grant_types
            .iter()
            .find(|g| !KNOWN_GRANT_TYPES.contains(&g.as_str()))
        {
            return Err(ServiceError::Validation(format!(
                "unknown grant type '{unknown}'"
            )));
        }
        if self.client_type == CLIENT_TYPE_PUBLIC
            && self.grant_types.iter().any(|g| g == GRANT_CLIENT_CREDENTIALS)
        {
            return Err(ServiceError::Validation(
                "public clients cannot use client_credentials".into(),
            ));
        }
        for uri in &self.redirect_uris {
            let parsed = url::Url::parse(uri)
                .map_err(|e| ServiceError::Validation(format!("invalid redirect URI '{uri}': {e}")))?;
            if parsed.fragment().is_some() {
                return Err(ServiceError::Validation(format!(
                    "redirect URI '{uri}' must not contain a fragment"
                )));
            }
        }
        if let Some(scope) = self
            .default_scopes
            .iter()
            .find(|s| !self.allowed_scopes.contains(s))
        {
            return Err(ServiceError::Validation(format!(
                "default scope '{scope}' is not in allowed scopes"
            )));
        }
        for ttl in [self.access_token_ttl, self.refresh_token_ttl, self.id_token_ttl]
            .into_iter()
            .flatten()
        {
            if ttl <= 0 {
                return Err(ServiceError::Validation("token lifetimes must be > 0".into()));
            }
        }
        Ok(())
    }
}

impl OAuthServer {
    /// Register a client. Confidential clients get a secret, returned once.
    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_client(&self, req: CreateClient) -> Result<RegisteredClient, ServiceError> {
        req.validate()?;

        let secret = if req.client_type == CLIENT_TYPE_CONFIDENTIAL {
            Some(new_client_secret()?)
        } else {
            None
        };
        let redirect_uris = serde_json::to_string(&req.redirect_uris)
            .map_err(|e| ServiceError::internal_with("failed to encode redirect URIs", e))?;
        let now = OffsetDateTime::now_utc();

        let client = oauth2_client::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            client_id: Set(new_client_id()?),
            client_secret_hash: Set(secret.as_deref().map(credential::hash_token)),
            name: Set(req.name),
            client_type: Set(req.client_type),
            redirect_uris: Set(redirect_uris),
            grant_types: Set(req.grant_types.join(" ")),
            allowed_scopes: Set(req.allowed_scopes.join(" ")),
            default_scopes: Set(req.default_scopes.join(" ")),
            require_pkce: Set(req.require_pkce),
            require_consent: Set(req.require_consent),
            first_party: Set(req.first_party),
            access_token_ttl: Set(req.access_token_ttl.unwrap_or(self.config.access_token_ttl)),
            refresh_token_ttl: Set(req
                .refresh_token_ttl
                .unwrap_or(self.config.refresh_token_ttl)),
            id_token_ttl: Set(req.id_token_ttl.unwrap_or(self.config.id_token_ttl)),
            is_active: Set(true),
            owner_id: Set(req.owner_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        tracing::info!(client_id = %client.client_id, client_type = %client.client_type, "OAuth client registered");
        Ok(RegisteredClient {
            client,
            client_secret: secret,
        })
    }

    /// Lookup by internal id.
    pub async fn get_client(&self, id: &str) -> Result<oauth2_client::Model, ServiceError> {
        oauth2_client::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("client {id}")))
    }

    /// Lookup by the public `client_id`.
    pub async fn get_client_by_client_id(
        &self,
        client_id: &str,
    ) -> Result<oauth2_client::Model, ServiceError> {
        oauth2_client::Entity::find()
            .filter(oauth2_client::Column::ClientId.eq(client_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("client {client_id}")))
    }

    pub async fn list_clients(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<oauth2_client::Model>, ServiceError> {
        let mut query = oauth2_client::Entity::find().order_by_asc(oauth2_client::Column::CreatedAt);
        if let Some(owner) = owner_id {
            query = query.filter(oauth2_client::Column::OwnerId.eq(owner));
        }
        Ok(query.all(self.db.as_ref()).await?)
    }

    /// Stop a client from authenticating. Tokens it already holds stay valid
    /// until they expire or are revoked.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate_client(&self, client_id: &str) -> Result<(), ServiceError> {
        let result = oauth2_client::Entity::update_many()
            .col_expr(oauth2_client::Column::IsActive, Expr::value(false))
            .col_expr(
                oauth2_client::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_client::Column::ClientId.eq(client_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("client {client_id}")));
        }
        tracing::info!(client_id, "OAuth client deactivated");
        Ok(())
    }

    /// Replace a confidential client's secret. The old secret stops working
    /// immediately.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_client_secret(&self, client_id: &str) -> Result<String, ServiceError> {
        let client = self.get_client_by_client_id(client_id).await?;
        if client.is_public() {
            return Err(ServiceError::Validation(
                "public clients have no secret".into(),
            ));
        }
        let secret = new_client_secret()?;
        oauth2_client::Entity::update_many()
            .col_expr(
                oauth2_client::Column::ClientSecretHash,
                Expr::value(credential::hash_token(&secret)),
            )
            .col_expr(
                oauth2_client::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_client::Column::Id.eq(client.id.as_str()))
            .exec(self.db.as_ref())
            .await?;
        tracing::info!(client_id, "OAuth client secret rotated");
        Ok(secret)
    }

    /// Resolve and authenticate the calling client. Confidential clients must
    /// present their secret; public clients are identified by id alone.
    pub async fn authenticate_client(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<oauth2_client::Model, OAuthError> {
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OAuthError::InvalidClient("client_id is required".into()))?;
        let client = match self.get_client_by_client_id(client_id).await {
            Ok(client) if client.is_active => client,
            Ok(_) | Err(ServiceError::NotFound(_)) => {
                return Err(OAuthError::InvalidClient("unknown or inactive client".into()));
            }
            Err(e) => return Err(e.into()),
        };

        if client.is_public() {
            return Ok(client);
        }
        let secret = client_secret
            .ok_or_else(|| OAuthError::InvalidClient("client authentication required".into()))?;
        let matches = client
            .client_secret_hash
            .as_deref()
            .is_some_and(|stored| constant_time_eq(stored, &credential::hash_token(secret)));
        if !matches {
            tracing::warn!(client_id = %client.client_id, "Client authentication failed");
            return Err(OAuthError::InvalidClient("invalid client credentials".into()));
        }
        Ok(client)
    }
}
