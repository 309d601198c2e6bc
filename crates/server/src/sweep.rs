//! Expiry sweeper.
//!
//! Deletes rows that can no longer be used: expired codes and tokens,
//! blacklist entries past their token's lifetime, and sessions that expired
//! or were revoked longer ago than the retention window. Rows already gone
//! are simply not counted, so overlapping sweeps are harmless.

use std::time::Duration;

use sea_orm::{ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::AppResources;
use crate::entity::{
    oauth2_access_token, oauth2_authorization, oauth2_device_code, oauth2_refresh_token, session,
    token_blacklist,
};
use crate::error::ServiceError;

/// Rows removed by one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub authorization_codes: u64,
    pub device_codes: u64,
    pub access_tokens: u64,
    pub refresh_tokens: u64,
    pub blacklist_rows: u64,
    /// In-process blacklist entries dropped
    pub blacklist_cached: usize,
}

impl SweepReport {
    pub fn total_rows(&self) -> u64 {
        self.sessions
            + self.authorization_codes
            + self.device_codes
            + self.access_tokens
            + self.refresh_tokens
            + self.blacklist_rows
    }
}

async fn delete_expired<C: ConnectionTrait>(
    conn: &C,
    now: OffsetDateTime,
    session_cutoff: OffsetDateTime,
) -> Result<SweepReport, ServiceError> {
    let sessions = session::Entity::delete_many()
        .filter(
            Condition::any()
                .add(session::Column::ExpiresAt.lt(session_cutoff))
                .add(session::Column::RevokedAt.lt(session_cutoff)),
        )
        .exec(conn)
        .await?
        .rows_affected;

    let authorization_codes = oauth2_authorization::Entity::delete_many()
        .filter(oauth2_authorization::Column::ExpiresAt.lt(now))
        .exec(conn)
        .await?
        .rows_affected;

    let device_codes = oauth2_device_code::Entity::delete_many()
        .filter(oauth2_device_code::Column::ExpiresAt.lt(now))
        .exec(conn)
        .await?
        .rows_affected;

    // Refresh tokens first: they reference access tokens.
    let refresh_tokens = oauth2_refresh_token::Entity::delete_many()
        .filter(oauth2_refresh_token::Column::ExpiresAt.lt(now))
        .exec(conn)
        .await?
        .rows_affected;

    let access_tokens = oauth2_access_token::Entity::delete_many()
        .filter(oauth2_access_token::Column::ExpiresAt.lt(now))
        .filter(
            oauth2_access_token::Column::Id.not_in_subquery(
                sea_orm::sea_query::Query::select()
                    .column(oauth2_refresh_token::Column::AccessTokenId)
                    .from(oauth2_refresh_token::Entity)
                    .to_owned(),
            ),
        )
        .exec(conn)
        .await?
        .rows_affected;

    let blacklist_rows = token_blacklist::Entity::delete_many()
        .filter(token_blacklist::Column::ExpiresAt.lt(now))
        .exec(conn)
        .await?
        .rows_affected;

    Ok(SweepReport {
        sessions,
        authorization_codes,
        device_codes,
        access_tokens,
        refresh_tokens,
        blacklist_rows,
        blacklist_cached: 0,
    })
}

/// Run one sweep in a single transaction.
#[tracing::instrument(skip(resources))]
pub async fn run_sweep(resources: &AppResources) -> Result<SweepReport, ServiceError> {
    let now = OffsetDateTime::now_utc();
    let retention = time::Duration::days(resources.config.sweep.session_retention_days.max(0));
    let session_cutoff = now - retention;

    let mut report = resources
        .coordinator
        .in_transaction(resources.db.as_ref(), "sweep", |txn| {
            Box::pin(async move { delete_expired(txn, now, session_cutoff).await })
        })
        .await?;
    report.blacklist_cached = resources.store.blacklist().purge_expired();

    tracing::info!(
        sessions = report.sessions,
        authorization_codes = report.authorization_codes,
        device_codes = report.device_codes,
        access_tokens = report.access_tokens,
        refresh_tokens = report.refresh_tokens,
        blacklist_rows = report.blacklist_rows,
        blacklist_cached = report.blacklist_cached,
        "Expiry sweep finished"
    );
    Ok(report)
}

/// Spawn the periodic sweeper. Stops when `shutdown` fires.
#[tracing::instrument(skip(resources, shutdown))]
pub fn spawn_sweep_task(resources: AppResources, shutdown: CancellationToken) {
    if !resources.config.sweep.enabled {
        tracing::info!("Expiry sweeper disabled");
        return;
    }
    let period = Duration::from_secs(resources.config.sweep.interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = run_sweep(&resources).await {
                        tracing::warn!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
    });
}
