//! Recorded user consent per client.

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

use super::{OAuthError, OAuthServer, scope};
use crate::entity::{oauth2_client, oauth2_consent};
use crate::error::ServiceError;

/// A live consent as shown to its user.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ConsentSummary {
    pub client_id: String,
    pub client_name: String,
    pub scopes: Vec<String>,
    /// Unix timestamp
    pub granted_at: i64,
}

impl OAuthServer {
    /// Whether an unrevoked consent of `user_id` to the client (internal id)
    /// covers every scope in `scopes`.
    pub async fn has_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
        scopes: &[String],
    ) -> Result<bool, ServiceError> {
        let consent = oauth2_consent::Entity::find()
            .filter(oauth2_consent::Column::UserId.eq(user_id))
            .filter(oauth2_consent::Column::ClientId.eq(client_internal_id))
            .one(self.db.as_ref())
            .await?;
        Ok(consent.is_some_and(|c| c.covers(scopes)))
    }

    /// Record that `user_id` grants `scopes` to the client. Re-granting
    /// replaces the scope set and clears an earlier revocation.
    #[tracing::instrument(skip(self))]
    pub async fn grant_consent(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
    ) -> Result<oauth2_consent::Model, OAuthError> {
        let client = self.active_client(client_id).await?;
        scope::validate_scopes(scopes, &client.allowed_scopes_list())?;

        let consent = self
            .coordinator
            .in_transaction(self.db.as_ref(), "grant_consent", |txn| {
                let user_id = user_id.to_string();
                let client_id = client.id.clone();
                let scopes = scope::join_scopes(scopes);
                Box::pin(async move {
                    let row = oauth2_consent::ActiveModel {
                        id: Set(uuid::Uuid::new_v4().to_string()),
                        user_id: Set(user_id.clone()),
                        client_id: Set(client_id.clone()),
                        scopes: Set(scopes),
                        granted_at: Set(OffsetDateTime::now_utc()),
                        revoked_at: Set(None),
                    };
                    oauth2_consent::Entity::insert(row)
                        .on_conflict(
                            OnConflict::columns([
                                oauth2_consent::Column::UserId,
                                oauth2_consent::Column::ClientId,
                            ])
                            .update_columns([
                                oauth2_consent::Column::Scopes,
                                oauth2_consent::Column::GrantedAt,
                                oauth2_consent::Column::RevokedAt,
                            ])
                            .to_owned(),
                        )
                        .exec_without_returning(txn)
                        .await?;
                    oauth2_consent::Entity::find()
                        .filter(oauth2_consent::Column::UserId.eq(user_id.as_str()))
                        .filter(oauth2_consent::Column::ClientId.eq(client_id.as_str()))
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::internal("consent vanished after upsert"))
                })
            })
            .await?;

        tracing::info!(user_id, client_id, scopes = %consent.scopes, "Consent granted");
        Ok(consent)
    }

    /// Withdraw consent and revoke every token the user holds for the client.
    /// Returns the number of tokens revoked.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_consent(&self, user_id: &str, client_id: &str) -> Result<u64, ServiceError> {
        let client = self.get_client_by_client_id(client_id).await?;
        let store = self.store.clone();
        let revoked = self
            .coordinator
            .in_transaction(self.db.as_ref(), "revoke_consent", |txn| {
                let store = store.clone();
                let user_id = user_id.to_string();
                let client_id = client.id.clone();
                Box::pin(async move {
                    let existing = oauth2_consent::Entity::find()
                        .filter(oauth2_consent::Column::UserId.eq(user_id.as_str()))
                        .filter(oauth2_consent::Column::ClientId.eq(client_id.as_str()))
                        .one(txn)
                        .await?;
                    if existing.is_none() {
                        return Err(ServiceError::NotFound("consent".into()));
                    }
                    let tokens = store
                        .revoke_user_client_tokens(txn, &user_id, &client_id)
                        .await?;
                    oauth2_consent::Entity::update_many()
                        .col_expr(
                            oauth2_consent::Column::RevokedAt,
                            Expr::value(OffsetDateTime::now_utc()),
                        )
                        .filter(oauth2_consent::Column::UserId.eq(user_id.as_str()))
                        .filter(oauth2_consent::Column::ClientId.eq(client_id.as_str()))
                        .filter(oauth2_consent::Column::RevokedAt.is_null())
                        .exec(txn)
                        .await?;
                    Ok(tokens)
                })
            })
            .await?;

        tracing::info!(user_id, client_id, tokens_revoked = revoked, "Consent revoked");
        Ok(revoked)
    }

    /// Unrevoked consents of a user, most recent first.
    pub async fn list_user_consents(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConsentSummary>, ServiceError> {
        let rows = oauth2_consent::Entity::find()
            .filter(oauth2_consent::Column::UserId.eq(user_id))
            .filter(oauth2_consent::Column::RevokedAt.is_null())
            .order_by_desc(oauth2_consent::Column::GrantedAt)
            .find_also_related(oauth2_client::Entity)
            .all(self.db.as_ref())
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(consent, client)| {
                let client = client?;
                Some(ConsentSummary {
                    client_id: client.client_id,
                    client_name: client.name,
                    scopes: consent.scopes_list(),
                    granted_at: consent.granted_at.unix_timestamp(),
                })
            })
            .collect())
    }

    /// Resolve an active client by its public id, for user-facing flows.
    pub(super) async fn active_client(
        &self,
        client_id: &str,
    ) -> Result<oauth2_client::Model, OAuthError> {
        match self.get_client_by_client_id(client_id).await {
            Ok(client) if client.is_active => Ok(client),
            Ok(_) | Err(ServiceError::NotFound(_)) => {
                Err(OAuthError::InvalidClient("unknown or inactive client".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check that an error may be sent to `redirect_uri` on behalf of the
    /// client, as when a user declines consent.
    pub async fn validate_redirect(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<(), OAuthError> {
        let client = self.active_client(client_id).await?;
        if !client.is_redirect_uri_allowed(redirect_uri) {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri is not registered for this client".into(),
            ));
        }
        Ok(())
    }
}
