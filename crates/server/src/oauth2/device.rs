//! Device Authorization Grant (RFC 8628).
//!
//! A device code moves `pending -> approved | denied | expired`, and an
//! approved code is consumed by the single poll that receives the tokens.

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, EntityTrait, QueryFilter,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use super::grants::required;
use super::{GRANT_DEVICE_CODE, OAuthError, OAuthServer, TokenRequest, TokenResponse, scope};
use crate::credential::{self, random_bytes};
use crate::entity::oauth2_device_code::{self, DeviceCodeStatus};
use crate::error::ServiceError;

/// Unambiguous characters only: no 0/O, 1/I.
const USER_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
/// Seconds added to the poll interval on every `slow_down`.
const SLOW_DOWN_STEP: i64 = 5;
const USER_CODE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// `XXXX-XXXX` drawn from [`USER_CODE_ALPHABET`].
fn generate_user_code() -> Result<String, ServiceError> {
    let bytes = random_bytes::<8>()?;
    let chars: String = bytes
        .iter()
        .map(|b| USER_CODE_ALPHABET[usize::from(*b) % USER_CODE_ALPHABET.len()] as char)
        .collect();
    Ok(format!("{}-{}", &chars[..4], &chars[4..]))
}

/// Accept what users actually type: lowercase, spaces, missing hyphen.
pub fn normalize_user_code(input: &str) -> String {
    let compact: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if compact.len() == 8 {
        format!("{}-{}", &compact[..4], &compact[4..])
    } else {
        compact
    }
}

impl OAuthServer {
    /// Start a device flow for `client_id`.
    #[tracing::instrument(skip(self))]
    pub async fn device_authorization(
        &self,
        client_id: &str,
        scope: Option<&str>,
    ) -> Result<DeviceAuthorization, OAuthError> {
        let client = self.active_client(client_id).await?;
        if !client.is_grant_type_allowed(GRANT_DEVICE_CODE) {
            return Err(OAuthError::UnauthorizedClient(
                "client is not allowed to use the device flow".into(),
            ));
        }
        let scopes = scope::resolve_scopes(&client, scope)?;

        let device_code = credential::issue()?;
        let now = OffsetDateTime::now_utc();
        let mut attempt = 0;
        let user_code = loop {
            attempt += 1;
            let user_code = generate_user_code()?;
            let row = oauth2_device_code::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                device_code_hash: Set(device_code.hash.clone()),
                user_code: Set(user_code.clone()),
                client_id: Set(client.id.clone()),
                scope: Set(scope::join_scopes(&scopes)),
                status: Set(DeviceCodeStatus::Pending.to_string()),
                user_id: Set(None),
                interval: Set(self.config.device_poll_interval),
                last_polled_at: Set(None),
                expires_at: Set(now + Duration::seconds(self.config.device_code_ttl)),
                created_at: Set(now),
            };
            match row.insert(self.db.as_ref()).await.map_err(ServiceError::from) {
                Ok(_) => break user_code,
                // user code collision
                Err(ServiceError::Conflict(_)) if attempt < USER_CODE_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(client_id = %client.client_id, "Device authorization started");
        Ok(DeviceAuthorization {
            device_code: device_code.plaintext,
            verification_uri_complete: format!("{}?user_code={user_code}", self.verification_uri),
            verification_uri: self.verification_uri.clone(),
            user_code,
            expires_in: self.config.device_code_ttl,
            interval: self.config.device_poll_interval,
        })
    }

    /// Token endpoint branch for the device grant.
    pub async fn poll_device_token(
        &self,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let device_code = required(&req.device_code, "device_code")?;
        let client = self
            .authenticate_client(req.client_id.as_deref(), req.client_secret.as_deref())
            .await?;

        let record = match self
            .store
            .find_device_code(self.db.as_ref(), &credential::hash_token(device_code))
            .await
        {
            Ok(record) => record,
            Err(ServiceError::NotFound(_)) => {
                return Err(OAuthError::InvalidGrant("invalid device code".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if record.client_id != client.id {
            return Err(OAuthError::InvalidGrant(
                "device code was not issued to this client".into(),
            ));
        }

        let status = record
            .status()
            .ok_or_else(|| ServiceError::internal(format!("unknown device status '{}'", record.status)))?;
        match status {
            DeviceCodeStatus::Consumed => {
                Err(OAuthError::InvalidGrant("device code already used".into()))
            }
            DeviceCodeStatus::Expired => Err(OAuthError::ExpiredToken),
            _ if record.is_expired() => {
                self.mark_device_code_expired(&record.id).await;
                Err(OAuthError::ExpiredToken)
            }
            DeviceCodeStatus::Denied => {
                Err(OAuthError::AccessDenied("the user denied the request".into()))
            }
            DeviceCodeStatus::Pending => {
                if self.record_poll(&record).await? {
                    Err(OAuthError::AuthorizationPending)
                } else {
                    tracing::debug!(client_id = %client.client_id, "Device polling too fast");
                    Err(OAuthError::SlowDown)
                }
            }
            DeviceCodeStatus::Approved => {
                let user_id = record
                    .user_id
                    .clone()
                    .ok_or_else(|| ServiceError::internal("approved device code has no user"))?;
                let scopes = scope::parse_scopes(Some(&record.scope));
                let issuer = self.token_issuer();
                let store = self.store.clone();
                let issued = self
                    .coordinator
                    .in_transaction(self.db.as_ref(), "poll_device_token", |txn| {
                        let issuer = issuer.clone();
                        let store = store.clone();
                        let client = client.clone();
                        let id = record.id.clone();
                        let user_id = user_id.clone();
                        let scopes = scopes.clone();
                        Box::pin(async move {
                            if !store.claim_device_code(txn, &id).await? {
                                return Ok(None);
                            }
                            let issued = issuer
                                .issue(txn, &client, Some(&user_id), &scopes, None)
                                .await?;
                            Ok(Some(issued))
                        })
                    })
                    .await?
                    .ok_or_else(|| OAuthError::InvalidGrant("device code already used".into()))?;

                self.link_session(&issued).await;
                Ok(issued.response)
            }
        }
    }

    /// Stamp `last_polled_at` if the client waited at least `interval`.
    /// Otherwise widen the interval and return false.
    async fn record_poll(&self, record: &oauth2_device_code::Model) -> Result<bool, ServiceError> {
        self.coordinator
            .run("record_device_poll", || self.try_record_poll(record))
            .await
    }

    async fn try_record_poll(
        &self,
        record: &oauth2_device_code::Model,
    ) -> Result<bool, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let earliest = now - Duration::seconds(record.interval);
        let result = oauth2_device_code::Entity::update_many()
            .col_expr(oauth2_device_code::Column::LastPolledAt, Expr::value(now))
            .filter(oauth2_device_code::Column::Id.eq(record.id.as_str()))
            .filter(
                Condition::any()
                    .add(oauth2_device_code::Column::LastPolledAt.is_null())
                    .add(oauth2_device_code::Column::LastPolledAt.lte(earliest)),
            )
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 1 {
            return Ok(true);
        }

        oauth2_device_code::Entity::update_many()
            .col_expr(
                oauth2_device_code::Column::Interval,
                Expr::col(oauth2_device_code::Column::Interval).add(SLOW_DOWN_STEP),
            )
            .col_expr(oauth2_device_code::Column::LastPolledAt, Expr::value(now))
            .filter(oauth2_device_code::Column::Id.eq(record.id.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(false)
    }

    async fn mark_device_code_expired(&self, id: &str) {
        let result = oauth2_device_code::Entity::update_many()
            .col_expr(
                oauth2_device_code::Column::Status,
                Expr::value(DeviceCodeStatus::Expired.as_str()),
            )
            .filter(oauth2_device_code::Column::Id.eq(id))
            .filter(oauth2_device_code::Column::Status.eq(DeviceCodeStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to mark device code expired");
        }
    }

    /// The user's decision on the verification page. Only a pending,
    /// unexpired code can be decided, and only once.
    #[tracing::instrument(skip(self))]
    pub async fn approve_device_code(
        &self,
        user_id: &str,
        user_code: &str,
        approve: bool,
    ) -> Result<(), ServiceError> {
        let user_code = normalize_user_code(user_code);
        let record = oauth2_device_code::Entity::find()
            .filter(oauth2_device_code::Column::UserCode.eq(user_code.as_str()))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound("device code".into()))?;
        if record.is_expired() {
            return Err(ServiceError::Validation("device code has expired".into()));
        }
        if record.status() != Some(DeviceCodeStatus::Pending) {
            return Err(ServiceError::Conflict("device code already processed".into()));
        }

        let decision = if approve {
            DeviceCodeStatus::Approved
        } else {
            DeviceCodeStatus::Denied
        };
        let db = self.db.as_ref();
        let record_id = record.id.as_str();
        let result = self
            .coordinator
            .run("approve_device_code", || async move {
                oauth2_device_code::Entity::update_many()
                    .col_expr(
                        oauth2_device_code::Column::Status,
                        Expr::value(decision.as_str()),
                    )
                    .col_expr(oauth2_device_code::Column::UserId, Expr::value(user_id))
                    .filter(oauth2_device_code::Column::Id.eq(record_id))
                    .filter(
                        oauth2_device_code::Column::Status.eq(DeviceCodeStatus::Pending.as_str()),
                    )
                    .filter(oauth2_device_code::Column::ExpiresAt.gt(OffsetDateTime::now_utc()))
                    .exec(db)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict("device code already processed".into()));
        }

        tracing::info!(user_id, decision = %decision, "Device code decided");
        Ok(())
    }
}
