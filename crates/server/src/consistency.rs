//! Transaction and retry coordination.
//!
//! Multi-step state transitions run through a [`Coordinator`], which wraps
//! the unit of work in a transaction and repeats it when the store reports a
//! serialization failure or deadlock. Storage errors are classified in one
//! place, [`classify_db_err`], and turned into [`ServiceError`] through its
//! `From<DbErr>` impl.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, IsolationLevel,
    RuntimeErr, SqlErr, TransactionTrait,
};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::ServiceError;

/// PostgreSQL serialization failure.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// PostgreSQL deadlock detected.
const SQLSTATE_DEADLOCK: &str = "40P01";
/// SQLite extended result codes: BUSY, BUSY_SNAPSHOT, LOCKED.
const SQLITE_BUSY_CODES: &[&str] = &["5", "517", "6"];

const RETRYABLE_MESSAGES: &[&str] = &[
    "could not serialize access",
    "deadlock detected",
    "database is locked",
    "database table is locked",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Serialization failure, deadlock or lock contention; safe to run again.
    Retryable,
    UniqueViolation,
    NotFound,
    Other,
}

/// Classify a storage error, primarily by its structured error code.
pub fn classify_db_err(err: &DbErr) -> DbErrorKind {
    if matches!(err, DbErr::RecordNotFound(_)) {
        return DbErrorKind::NotFound;
    }

    if let Some(code) = sqlstate(err) {
        if code == SQLSTATE_SERIALIZATION_FAILURE
            || code == SQLSTATE_DEADLOCK
            || SQLITE_BUSY_CODES.contains(&code.as_str())
        {
            return DbErrorKind::Retryable;
        }
    }

    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return DbErrorKind::UniqueViolation;
    }

    // Fallback for drivers that only surface text.
    let text = err.to_string().to_lowercase();
    if RETRYABLE_MESSAGES.iter().any(|m| text.contains(m)) {
        return DbErrorKind::Retryable;
    }

    DbErrorKind::Other
}

fn sqlstate(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Exec(e) | DbErr::Query(e) | DbErr::Conn(e) => e,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(sea_orm::sqlx::Error::Database(db_err)) => {
            db_err.code().map(|c| c.into_owned())
        }
        _ => None,
    }
}

/// Retry bounds for the coordinator.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug)]
pub struct Coordinator {
    policy: RetryPolicy,
    /// Process-wide token used when a caller does not bring its own.
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self { policy, shutdown }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `work` until it succeeds, fails with a non-retryable error, or the
    /// retry bound is reached.
    pub async fn run<T, F, Fut>(&self, operation: &str, work: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.run_with(&self.shutdown, operation, work).await
    }

    /// Like [`Coordinator::run`] but observing the caller's cancellation token.
    pub async fn run_with<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut work: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            match work().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Retryable conflict"
                    );
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        let delay = self.policy.backoff(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(operation, attempts, "Retries exhausted");
        Err(ServiceError::Internal {
            message: format!("{operation} failed after {attempts} attempts"),
            source: last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        })
    }

    /// Run `work` inside a transaction, retrying the whole transaction on
    /// conflicts. The transaction commits only when `work` returns `Ok`.
    pub async fn in_transaction<T, F>(
        &self,
        db: &DatabaseConnection,
        operation: &str,
        work: F,
    ) -> Result<T, ServiceError>
    where
        F: for<'c> Fn(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>>,
    {
        self.in_transaction_with(db, &self.shutdown, operation, work)
            .await
    }

    pub async fn in_transaction_with<T, F>(
        &self,
        db: &DatabaseConnection,
        cancel: &CancellationToken,
        operation: &str,
        work: F,
    ) -> Result<T, ServiceError>
    where
        F: for<'c> Fn(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>>,
    {
        let work = &work;
        self.run_with(cancel, operation, move || async move {
            let txn = begin(db).await?;
            // Dropping `txn` on the error path rolls it back.
            let value = work(&txn).await?;
            txn.commit().await?;
            Ok(value)
        })
        .await
    }
}

/// Open a transaction, at serializable isolation where the backend supports
/// choosing it.
pub async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction, DbErr> {
    match db.get_database_backend() {
        DbBackend::Postgres => {
            db.begin_with_config(Some(IsolationLevel::Serializable), None)
                .await
        }
        _ => db.begin().await,
    }
}
