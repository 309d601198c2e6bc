//! Credential and token lifecycle engine for an identity gateway.
//!
//! The crate issues, validates, rotates and revokes credentials for
//! first-party sessions and for OAuth2/OpenID Connect clients, and answers
//! role-based authorization questions for other services.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::consistency::{Coordinator, RetryPolicy};
use crate::credential::CredentialStore;
use crate::gateway::Gateway;
use crate::oauth2::OAuthServer;
use crate::rate_limit::{InMemoryRateLimiter, RateLimiter};
use crate::rbac::RbacEngine;
use crate::session::SessionManager;
use crate::signer::{HmacSigner, TokenSigner};

pub mod api;
pub mod config;
pub mod consistency;
pub mod credential;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod oauth2;
pub mod rate_limit;
pub mod rbac;
pub mod session;
pub mod signer;
pub mod sweep;

/// Every service the HTTP layer and background tasks need, wired to one
/// database and one configuration.
#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub store: CredentialStore,
    pub coordinator: Coordinator,
    pub signer: Arc<dyn TokenSigner>,
    pub rbac: RbacEngine,
    pub sessions: SessionManager,
    pub oauth: OAuthServer,
    pub gateway: Gateway,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

impl AppResources {
    /// Wire the default HS256 signer and in-process rate limiter.
    pub fn new(db: Arc<DatabaseConnection>, config: AppConfig, shutdown: CancellationToken) -> Self {
        let signer: Arc<dyn TokenSigner> =
            Arc::new(HmacSigner::new(config.jwt.secret.as_bytes(), config.issuer()));
        Self::with_seams(db, config, shutdown, signer, Arc::new(InMemoryRateLimiter::new()))
    }

    /// Wire with caller-provided signer and rate limiter.
    pub fn with_seams(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        shutdown: CancellationToken,
        signer: Arc<dyn TokenSigner>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        let coordinator = Coordinator::new(RetryPolicy::from(&config.retry), shutdown);
        let store = CredentialStore::new(db.clone(), config.session.blacklist_db_fallback);
        let rbac = RbacEngine::new(
            db.clone(),
            coordinator.clone(),
            config.rbac.admin_role_name.clone(),
        );
        let sessions = SessionManager::new(
            db.clone(),
            store.clone(),
            signer.clone(),
            rbac.clone(),
            coordinator.clone(),
            config.session.clone(),
            config.issuer(),
        );
        let oauth = OAuthServer::new(
            db.clone(),
            store.clone(),
            coordinator.clone(),
            sessions.clone(),
            signer.clone(),
            &config,
        );
        let gateway = Gateway::new(db.clone(), store.clone(), signer.clone(), rbac.clone());

        Self {
            db,
            config: Arc::new(config),
            store,
            coordinator,
            signer,
            rbac,
            sessions,
            oauth,
            gateway,
            rate_limiter,
        }
    }
}
