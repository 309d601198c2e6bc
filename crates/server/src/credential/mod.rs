//! Credential store.
//!
//! Every bearer secret the gateway hands out (authorization codes, device
//! codes, OAuth tokens, session refresh tokens) is generated here and stored
//! only as its sha256 fingerprint. One-time claims are single conditional
//! updates; zero affected rows means someone else got there first.

mod blacklist;

use std::sync::Arc;

use base64::Engine;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

pub use blacklist::{Blacklist, BlacklistEntry};

use crate::entity::oauth2_device_code::DeviceCodeStatus;
use crate::entity::{
    oauth2_access_token, oauth2_authorization, oauth2_device_code, oauth2_refresh_token,
};
use crate::error::ServiceError;

/// Bytes of entropy in every generated secret.
pub const TOKEN_BYTES: usize = 32;

/// A freshly generated secret. `plaintext` goes to the caller exactly once.
#[derive(Clone)]
pub struct IssuedSecret {
    pub plaintext: String,
    pub hash: String,
}

impl std::fmt::Debug for IssuedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedSecret")
            .field("plaintext", &"<redacted>")
            .field("hash", &self.hash)
            .finish()
    }
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N], ServiceError> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes)
        .map_err(|e| ServiceError::internal(format!("random number generator failed: {e}")))?;
    Ok(bytes)
}

/// 32 random bytes, base64url without padding.
pub fn generate_token() -> Result<String, ServiceError> {
    let bytes = random_bytes::<TOKEN_BYTES>()?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Lowercase hex sha256. Unsalted: inputs carry 256 bits of entropy.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub fn issue() -> Result<IssuedSecret, ServiceError> {
    let plaintext = generate_token()?;
    let hash = hash_token(&plaintext);
    Ok(IssuedSecret { plaintext, hash })
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<DatabaseConnection>,
    blacklist: Arc<Blacklist>,
}

impl CredentialStore {
    pub fn new(db: Arc<DatabaseConnection>, blacklist_db_fallback: bool) -> Self {
        let blacklist = Arc::new(Blacklist::new(db.clone(), blacklist_db_fallback));
        Self { db, blacklist }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub async fn find_access_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
    ) -> Result<oauth2_access_token::Model, ServiceError> {
        oauth2_access_token::Entity::find()
            .filter(oauth2_access_token::Column::TokenHash.eq(token_hash))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("access token".into()))
    }

    pub async fn find_refresh_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
    ) -> Result<oauth2_refresh_token::Model, ServiceError> {
        oauth2_refresh_token::Entity::find()
            .filter(oauth2_refresh_token::Column::TokenHash.eq(token_hash))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("refresh token".into()))
    }

    pub async fn find_authorization_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        code_hash: &str,
    ) -> Result<oauth2_authorization::Model, ServiceError> {
        oauth2_authorization::Entity::find()
            .filter(oauth2_authorization::Column::CodeHash.eq(code_hash))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("authorization code".into()))
    }

    pub async fn find_device_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        device_code_hash: &str,
    ) -> Result<oauth2_device_code::Model, ServiceError> {
        oauth2_device_code::Entity::find()
            .filter(oauth2_device_code::Column::DeviceCodeHash.eq(device_code_hash))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("device code".into()))
    }

    /// `used = false -> true`. Returns false when the code was already used.
    pub async fn claim_authorization_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
    ) -> Result<bool, ServiceError> {
        let result = oauth2_authorization::Entity::update_many()
            .col_expr(oauth2_authorization::Column::Used, Expr::value(true))
            .filter(oauth2_authorization::Column::Id.eq(id))
            .filter(oauth2_authorization::Column::Used.eq(false))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `approved -> consumed`. Returns false when tokens were already issued.
    pub async fn claim_device_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
    ) -> Result<bool, ServiceError> {
        let result = oauth2_device_code::Entity::update_many()
            .col_expr(
                oauth2_device_code::Column::Status,
                Expr::value(DeviceCodeStatus::Consumed.as_str()),
            )
            .filter(oauth2_device_code::Column::Id.eq(id))
            .filter(oauth2_device_code::Column::Status.eq(DeviceCodeStatus::Approved.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Revoke a live refresh token as part of rotation. Returns false when it
    /// was already revoked or has expired.
    pub async fn claim_refresh_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
    ) -> Result<bool, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let result = oauth2_refresh_token::Entity::update_many()
            .col_expr(oauth2_refresh_token::Column::RevokedAt, Expr::value(now))
            .filter(oauth2_refresh_token::Column::TokenHash.eq(token_hash))
            .filter(oauth2_refresh_token::Column::RevokedAt.is_null())
            .filter(oauth2_refresh_token::Column::ExpiresAt.gt(now))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Idempotent. Returns whether a row changed.
    pub async fn revoke_access_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
    ) -> Result<bool, ServiceError> {
        let result = oauth2_access_token::Entity::update_many()
            .col_expr(
                oauth2_access_token::Column::RevokedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_access_token::Column::TokenHash.eq(token_hash))
            .filter(oauth2_access_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn revoke_access_token_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
    ) -> Result<bool, ServiceError> {
        let result = oauth2_access_token::Entity::update_many()
            .col_expr(
                oauth2_access_token::Column::RevokedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_access_token::Column::Id.eq(id))
            .filter(oauth2_access_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Idempotent. Also revokes the access token issued alongside it.
    pub async fn revoke_refresh_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
    ) -> Result<bool, ServiceError> {
        let token = match self.find_refresh_token(conn, token_hash).await {
            Ok(token) => token,
            Err(ServiceError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let result = oauth2_refresh_token::Entity::update_many()
            .col_expr(
                oauth2_refresh_token::Column::RevokedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_refresh_token::Column::Id.eq(token.id.as_str()))
            .filter(oauth2_refresh_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        self.revoke_access_token_by_id(conn, &token.access_token_id)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Revoke every live token a user holds for one client.
    pub async fn revoke_user_client_tokens<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: &str,
        client_id: &str,
    ) -> Result<u64, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let access = oauth2_access_token::Entity::update_many()
            .col_expr(oauth2_access_token::Column::RevokedAt, Expr::value(now))
            .filter(oauth2_access_token::Column::UserId.eq(user_id))
            .filter(oauth2_access_token::Column::ClientId.eq(client_id))
            .filter(oauth2_access_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        let refresh = oauth2_refresh_token::Entity::update_many()
            .col_expr(oauth2_refresh_token::Column::RevokedAt, Expr::value(now))
            .filter(oauth2_refresh_token::Column::UserId.eq(user_id))
            .filter(oauth2_refresh_token::Column::ClientId.eq(client_id))
            .filter(oauth2_refresh_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(access.rows_affected + refresh.rows_affected)
    }

    pub async fn is_blacklisted(&self, token_hash: &str) -> Result<bool, ServiceError> {
        self.blacklist.contains(token_hash).await
    }
}
