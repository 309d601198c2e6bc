//! OAuth2 / OpenID Connect authorization server.
//!
//! ## Supported Flows
//!
//! - Authorization Code with PKCE
//! - Device Authorization (RFC 8628)
//! - Client Credentials
//! - Refresh Token, rotating on every use
//!
//! ## Endpoints
//!
//! - `GET /oauth2/authorize` - Authorization endpoint
//! - `POST /oauth2/token` - Token endpoint
//! - `POST /oauth2/introspect` - Token introspection (RFC 7662)
//! - `POST /oauth2/revoke` - Token revocation (RFC 7009)
//! - `POST /oauth2/consent` - Record a consent decision
//! - `POST /oauth2/device/code` / `POST /oauth2/device/approve` - Device flow
//! - `GET /oauth2/userinfo` - OpenID Connect UserInfo
//! - `GET /.well-known/openid-configuration`, `GET /.well-known/jwks.json`
//!
//! Every bearer value handed out here is opaque and stored only as its
//! sha256 fingerprint by the [`CredentialStore`].

mod authorization_code;
pub mod client;
mod consent;
mod device;
mod discovery;
pub mod endpoints;
mod error;
mod grants;
mod introspection;
pub mod pkce;
pub mod scope;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

pub use authorization_code::{AuthorizationGrant, AuthorizeRequest};
pub use client::{CreateClient, RegisteredClient};
pub use consent::ConsentSummary;
pub use device::DeviceAuthorization;
pub use discovery::DiscoveryDocument;
pub use endpoints::{router, well_known_router};
pub use error::OAuthError;
pub use grants::{
    GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS, GRANT_DEVICE_CODE, GRANT_REFRESH_TOKEN,
    TokenRequest, TokenResponse,
};
pub use introspection::{IntrospectionResponse, UserInfo};

use crate::config::{AppConfig, OAuth2Config};
use crate::consistency::Coordinator;
use crate::credential::CredentialStore;
use crate::session::SessionManager;
use crate::signer::TokenSigner;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";

#[derive(Clone)]
pub struct OAuthServer {
    db: Arc<DatabaseConnection>,
    store: CredentialStore,
    coordinator: Coordinator,
    sessions: SessionManager,
    signer: Arc<dyn TokenSigner>,
    config: OAuth2Config,
    issuer: String,
    base_url: String,
    verification_uri: String,
}

impl OAuthServer {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: CredentialStore,
        coordinator: Coordinator,
        sessions: SessionManager,
        signer: Arc<dyn TokenSigner>,
        config: &AppConfig,
    ) -> Self {
        Self {
            db,
            store,
            coordinator,
            sessions,
            signer,
            config: config.oauth2.clone(),
            issuer: config.issuer().to_string(),
            base_url: config.issuer_url.trim_end_matches('/').to_string(),
            verification_uri: config.device_verification_uri(),
        }
    }

    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }
}
