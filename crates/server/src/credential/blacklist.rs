use dashmap::DashMap;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::entity::token_blacklist;
use crate::error::ServiceError;

#[derive(Clone, Debug)]
pub struct BlacklistEntry {
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
}

impl BlacklistEntry {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }
}

/// Revoked access-token fingerprints.
///
/// The `token_blacklist` table is authoritative; the map caches entries this
/// process wrote or has already seen.
pub struct Blacklist {
    db: Arc<DatabaseConnection>,
    cache: DashMap<String, OffsetDateTime>,
    db_fallback: bool,
}

impl Blacklist {
    pub fn new(db: Arc<DatabaseConnection>, db_fallback: bool) -> Self {
        Self {
            db,
            cache: DashMap::new(),
            db_fallback,
        }
    }

    /// Blacklist a token for `ttl`, persisting and caching it.
    pub async fn add(
        &self,
        token_hash: &str,
        user_id: Option<&str>,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        if let Some(entry) = self
            .persist(self.db.as_ref(), token_hash, user_id, ttl)
            .await?
        {
            self.remember(entry);
        }
        Ok(())
    }

    /// Write the durable row only. Callers inside a transaction pass the
    /// returned entry to [`Blacklist::remember`] after commit.
    ///
    /// Non-positive TTLs are skipped: the token has already expired.
    pub async fn persist<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_hash: &str,
        user_id: Option<&str>,
        ttl: Duration,
    ) -> Result<Option<BlacklistEntry>, ServiceError> {
        if ttl <= Duration::ZERO {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;
        let row = token_blacklist::ActiveModel {
            token_hash: Set(token_hash.to_string()),
            user_id: Set(user_id.map(String::from)),
            expires_at: Set(expires_at),
            created_at: Set(now),
        };
        token_blacklist::Entity::insert(row)
            .on_conflict(
                OnConflict::column(token_blacklist::Column::TokenHash)
                    .update_column(token_blacklist::Column::ExpiresAt)
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(Some(BlacklistEntry {
            token_hash: token_hash.to_string(),
            expires_at,
        }))
    }

    pub fn remember(&self, entry: BlacklistEntry) {
        self.cache.insert(entry.token_hash, entry.expires_at);
    }

    pub async fn contains(&self, token_hash: &str) -> Result<bool, ServiceError> {
        let now = OffsetDateTime::now_utc();
        if let Some(expires_at) = self.cache.get(token_hash).map(|e| *e) {
            if expires_at > now {
                return Ok(true);
            }
            self.cache.remove(token_hash);
            return Ok(false);
        }

        if !self.db_fallback {
            return Ok(false);
        }

        let row = token_blacklist::Entity::find_by_id(token_hash.to_string())
            .filter(token_blacklist::Column::ExpiresAt.gt(now))
            .one(self.db.as_ref())
            .await?;
        match row {
            Some(row) => {
                self.cache.insert(row.token_hash, row.expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Prime the cache with every unexpired row. Called once at startup.
    pub async fn sync_from_database(&self) -> Result<usize, ServiceError> {
        let rows = token_blacklist::Entity::find()
            .filter(token_blacklist::Column::ExpiresAt.gt(OffsetDateTime::now_utc()))
            .all(self.db.as_ref())
            .await?;
        let count = rows.len();
        for row in rows {
            self.cache.insert(row.token_hash, row.expires_at);
        }
        tracing::info!(entries = count, "Blacklist cache primed from database");
        Ok(count)
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.cache.len();
        self.cache.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
