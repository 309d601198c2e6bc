use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use time::{Duration, OffsetDateTime};

use super::{
    SessionCreationParams, SessionInfo, SessionMetadata, SessionRefreshParams, SessionTokens,
};
use crate::config::SessionConfig;
use crate::consistency::Coordinator;
use crate::credential::{self, CredentialStore};
use crate::entity::{session, user};
use crate::error::ServiceError;
use crate::rbac::RbacEngine;
use crate::signer::{AccessClaims, SignerError, TokenSigner};

const NOT_FOUND_OR_REVOKED: &str = "session not found or revoked";

#[derive(Clone)]
pub struct SessionManager {
    db: Arc<DatabaseConnection>,
    store: CredentialStore,
    signer: Arc<dyn TokenSigner>,
    rbac: RbacEngine,
    coordinator: Coordinator,
    config: SessionConfig,
    issuer: String,
}

/// A signed access token and its fingerprint.
struct SignedAccess {
    token: String,
    hash: String,
}

impl SessionManager {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: CredentialStore,
        signer: Arc<dyn TokenSigner>,
        rbac: RbacEngine,
        coordinator: Coordinator,
        config: SessionConfig,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            db,
            store,
            signer,
            rbac,
            coordinator,
            config,
            issuer: issuer.into(),
        }
    }

    fn access_ttl(&self) -> Duration {
        Duration::seconds(self.config.access_token_ttl_secs)
    }

    fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.config.refresh_token_ttl_secs)
    }

    /// Email and role names for the access-token claims.
    async fn identity(&self, user_id: &str) -> Result<(Option<String>, Vec<String>), ServiceError> {
        let email = match user::Entity::find_by_id(user_id.to_string())
            .one(self.db.as_ref())
            .await?
        {
            Some(u) if !u.is_active => {
                return Err(ServiceError::Forbidden("user is inactive".into()));
            }
            Some(u) => Some(u.email),
            None => None,
        };
        let roles = self.rbac.get_user_role_names(user_id).await?;
        Ok((email, roles))
    }

    fn sign_access(
        &self,
        user_id: &str,
        session_id: &str,
        email: Option<String>,
        roles: Vec<String>,
    ) -> Result<SignedAccess, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            email,
            roles,
            iss: self.issuer.clone(),
            iat: now.unix_timestamp(),
            nbf: now.unix_timestamp(),
            exp: (now + self.access_ttl()).unix_timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = self
            .signer
            .sign_access(&claims)
            .map_err(|e| ServiceError::internal_with("failed to sign access token", e))?;
        let hash = credential::hash_token(&token);
        Ok(SignedAccess { token, hash })
    }

    /// Store a session row. Used directly when another flow has already
    /// issued the tokens.
    pub async fn create_session_with_params<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Option<String>,
        params: SessionCreationParams,
    ) -> Result<session::Model, ServiceError> {
        params.validate()?;
        let now = OffsetDateTime::now_utc();
        let row = session::ActiveModel {
            id: Set(id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
            user_id: Set(params.user_id.clone()),
            client_id: Set(params.client_id),
            token_hash: Set(params.token_hash),
            access_token_hash: Set(params.access_token_hash),
            ip_address: Set(params.metadata.ip_address),
            user_agent: Set(params.metadata.user_agent),
            session_name: Set(params.metadata.session_name),
            expires_at: Set(params.expires_at),
            revoked_at: Set(None),
            last_active_at: Set(now),
            created_at: Set(now),
        };
        let created = row.insert(conn).await?;
        tracing::info!(session_id = %created.id, user_id = %params.user_id, "Session created");
        Ok(created)
    }

    /// Log a user in: issue an access/refresh pair and record the session.
    #[tracing::instrument(skip(self, metadata))]
    pub async fn create_session(
        &self,
        user_id: &str,
        metadata: SessionMetadata,
    ) -> Result<SessionTokens, ServiceError> {
        let (email, roles) = self.identity(user_id).await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let refresh = credential::issue()?;
        let access = self.sign_access(user_id, &session_id, email, roles)?;

        let params = SessionCreationParams {
            user_id: user_id.to_string(),
            client_id: None,
            token_hash: refresh.hash,
            access_token_hash: Some(access.hash),
            expires_at: OffsetDateTime::now_utc() + self.refresh_ttl(),
            metadata,
        };
        self.coordinator
            .run("create_session", || {
                self.create_session_with_params(
                    self.db.as_ref(),
                    Some(session_id.clone()),
                    params.clone(),
                )
            })
            .await?;

        Ok(SessionTokens {
            access_token: access.token,
            refresh_token: refresh.plaintext,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_ttl_secs,
            session_id,
        })
    }

    /// Rotate a session's token hashes in place.
    ///
    /// The update only matches a live session still holding the old hash, so
    /// of two concurrent rotations with the same token exactly one succeeds.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_session_tokens(
        &self,
        params: SessionRefreshParams,
    ) -> Result<(), ServiceError> {
        params.validate()?;
        self.coordinator
            .run("refresh_session_tokens", || rotate(self.db.as_ref(), &params))
            .await
    }

    /// Exchange a first-party refresh token for a new pair. The presented
    /// token stops working as soon as this returns, and the access token
    /// issued with it is blacklisted.
    ///
    /// Sessions mirroring an OAuth grant are rotated by the token endpoint
    /// only, so their refresh tokens are rejected here.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, ServiceError> {
        let old_hash = credential::hash_token(refresh_token);
        let current = session::Entity::find()
            .filter(session::Column::TokenHash.eq(old_hash.as_str()))
            .filter(session::Column::ClientId.is_null())
            .one(self.db.as_ref())
            .await?
            .filter(|s| s.is_active())
            .ok_or_else(|| ServiceError::NotFound(NOT_FOUND_OR_REVOKED.into()))?;

        let (email, roles) = self.identity(&current.user_id).await?;
        let refresh = credential::issue()?;
        let access = self.sign_access(&current.user_id, &current.id, email, roles)?;

        let params = SessionRefreshParams {
            client_id: None,
            old_token_hash: old_hash,
            new_token_hash: refresh.hash,
            new_access_token_hash: Some(access.hash),
            new_expires_at: OffsetDateTime::now_utc() + self.refresh_ttl(),
        };
        params.validate()?;
        let ttl = self.access_ttl();
        let entry = self
            .coordinator
            .in_transaction(self.db.as_ref(), "refresh_session", |txn| {
                let store = self.store.clone();
                let params = params.clone();
                let previous_access = current.access_token_hash.clone();
                let user_id = current.user_id.clone();
                Box::pin(async move {
                    rotate(txn, &params).await?;
                    match previous_access {
                        Some(hash) => {
                            store
                                .blacklist()
                                .persist(txn, &hash, Some(user_id.as_str()), ttl)
                                .await
                        }
                        None => Ok(None),
                    }
                })
            })
            .await?;
        if let Some(entry) = entry {
            self.store.blacklist().remember(entry);
        }

        tracing::debug!(session_id = %current.id, user_id = %current.user_id, "Session refreshed");
        Ok(SessionTokens {
            access_token: access.token,
            refresh_token: refresh.plaintext,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_ttl_secs,
            session_id: current.id,
        })
    }

    /// Revoke one of the user's sessions. Revoking an already revoked session
    /// succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_session(&self, user_id: &str, session_id: &str) -> Result<(), ServiceError> {
        let ttl = self.access_ttl();
        let entry = self
            .coordinator
            .in_transaction(self.db.as_ref(), "revoke_session", |txn| {
                let store = self.store.clone();
                let user_id = user_id.to_string();
                let session_id = session_id.to_string();
                Box::pin(async move {
                    let current = session::Entity::find_by_id(session_id.clone())
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;
                    if current.user_id != user_id {
                        return Err(ServiceError::Forbidden(
                            "session belongs to another user".into(),
                        ));
                    }
                    if current.revoked_at.is_some() {
                        return Ok(None);
                    }

                    let entry = match &current.access_token_hash {
                        Some(hash) => {
                            store
                                .blacklist()
                                .persist(txn, hash, Some(user_id.as_str()), ttl)
                                .await?
                        }
                        None => None,
                    };
                    if !current.is_first_party() {
                        store.revoke_refresh_token(txn, &current.token_hash).await?;
                    }
                    revoke_by_id(txn, &session_id).await?;
                    Ok(entry)
                })
            })
            .await?;

        if let Some(entry) = entry {
            self.store.blacklist().remember(entry);
        }
        tracing::info!(session_id, user_id, "Session revoked");
        Ok(())
    }

    /// Revoke every live session of a user, optionally keeping one. Returns
    /// the number of sessions revoked.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_all_user_sessions(
        &self,
        user_id: &str,
        except_session_id: Option<&str>,
    ) -> Result<u64, ServiceError> {
        let ttl = self.access_ttl();
        let (revoked, entries) = self
            .coordinator
            .in_transaction(self.db.as_ref(), "revoke_all_user_sessions", |txn| {
                let store = self.store.clone();
                let user_id = user_id.to_string();
                let except = except_session_id.map(String::from);
                Box::pin(async move {
                    let mut live = session::Entity::find()
                        .filter(session::Column::UserId.eq(user_id.as_str()))
                        .filter(session::Column::RevokedAt.is_null());
                    if let Some(except) = &except {
                        live = live.filter(session::Column::Id.ne(except.as_str()));
                    }
                    let sessions = live.all(txn).await?;

                    let mut entries = Vec::new();
                    for s in &sessions {
                        if !s.is_first_party() {
                            store.revoke_refresh_token(txn, &s.token_hash).await?;
                        }
                        if let Some(hash) = &s.access_token_hash {
                            if let Some(entry) = store
                                .blacklist()
                                .persist(txn, hash, Some(user_id.as_str()), ttl)
                                .await?
                            {
                                entries.push(entry);
                            }
                        }
                    }

                    let mut update = session::Entity::update_many()
                        .col_expr(
                            session::Column::RevokedAt,
                            Expr::value(OffsetDateTime::now_utc()),
                        )
                        .filter(session::Column::UserId.eq(user_id.as_str()))
                        .filter(session::Column::RevokedAt.is_null());
                    if let Some(except) = &except {
                        update = update.filter(session::Column::Id.ne(except.as_str()));
                    }
                    let result = update.exec(txn).await?;
                    Ok((result.rows_affected, entries))
                })
            })
            .await?;

        for entry in entries {
            self.store.blacklist().remember(entry);
        }
        tracing::info!(user_id, revoked, "User sessions revoked");
        Ok(revoked)
    }

    /// Revoke the session currently holding `token_hash`. Unknown or already
    /// revoked sessions are not an error.
    #[tracing::instrument(skip_all)]
    pub async fn revoke_session_by_token_hash(&self, token_hash: &str) -> Result<(), ServiceError> {
        let Some(current) = session::Entity::find()
            .filter(session::Column::TokenHash.eq(token_hash))
            .filter(session::Column::RevokedAt.is_null())
            .one(self.db.as_ref())
            .await?
        else {
            return Ok(());
        };
        self.revoke_session(&current.user_id, &current.id).await
    }

    /// Verify a session access token and reject blacklisted ones.
    pub async fn validate_access_token(&self, token: &str) -> Result<AccessClaims, ServiceError> {
        let claims = self.signer.verify_access(token).map_err(|e| match e {
            SignerError::Sign(_) => ServiceError::internal_with("token verification failed", e),
            _ => ServiceError::InvalidOrExpiredToken,
        })?;
        if self
            .store
            .is_blacklisted(&credential::hash_token(token))
            .await?
        {
            return Err(ServiceError::Revoked);
        }
        Ok(claims)
    }

    /// Blacklist the presented access token for the rest of its lifetime and
    /// revoke the session it belongs to.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, access_token: &str) -> Result<(), ServiceError> {
        let claims = match self.validate_access_token(access_token).await {
            Ok(claims) => claims,
            // Already logged out.
            Err(ServiceError::Revoked) => return Ok(()),
            Err(e) => return Err(e),
        };
        let remaining = claims.exp - OffsetDateTime::now_utc().unix_timestamp();
        self.store
            .blacklist()
            .add(
                &credential::hash_token(access_token),
                Some(&claims.sub),
                Duration::seconds(remaining),
            )
            .await?;

        match self.revoke_session(&claims.sub, &claims.sid).await {
            Ok(()) | Err(ServiceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Live sessions of a user, newest first.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, ServiceError> {
        let sessions = session::Entity::find()
            .filter(session::Column::UserId.eq(user_id))
            .filter(session::Column::RevokedAt.is_null())
            .filter(session::Column::ExpiresAt.gt(OffsetDateTime::now_utc()))
            .order_by_desc(session::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }
}

/// Conditional in-place rotation. Zero matched rows means the old token was
/// already rotated, revoked or expired, or belongs to a session of another
/// origin.
async fn rotate<C: ConnectionTrait>(
    conn: &C,
    params: &SessionRefreshParams,
) -> Result<(), ServiceError> {
    let now = OffsetDateTime::now_utc();
    let origin = match &params.client_id {
        Some(client_id) => session::Column::ClientId.eq(client_id.as_str()),
        None => session::Column::ClientId.is_null(),
    };
    let result = session::Entity::update_many()
        .col_expr(
            session::Column::TokenHash,
            Expr::value(params.new_token_hash.clone()),
        )
        .col_expr(
            session::Column::AccessTokenHash,
            Expr::value(params.new_access_token_hash.clone()),
        )
        .col_expr(session::Column::ExpiresAt, Expr::value(params.new_expires_at))
        .col_expr(session::Column::LastActiveAt, Expr::value(now))
        .filter(session::Column::TokenHash.eq(params.old_token_hash.as_str()))
        .filter(origin)
        .filter(session::Column::RevokedAt.is_null())
        .filter(session::Column::ExpiresAt.gt(now))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(NOT_FOUND_OR_REVOKED.into()));
    }
    Ok(())
}

async fn revoke_by_id<C: ConnectionTrait>(conn: &C, session_id: &str) -> Result<u64, ServiceError> {
    let result = session::Entity::update_many()
        .col_expr(
            session::Column::RevokedAt,
            Expr::value(OffsetDateTime::now_utc()),
        )
        .filter(session::Column::Id.eq(session_id))
        .filter(session::Column::RevokedAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
