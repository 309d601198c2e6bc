//! OAuth2 Client entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const CLIENT_TYPE_PUBLIC: &str = "public";
pub const CLIENT_TYPE_CONFIDENTIAL: &str = "confidential";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Public identifier presented by the client (`agw_...`)
    #[sea_orm(unique)]
    pub client_id: String,
    /// sha256 hex of the client secret (None for public clients)
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    pub name: String,
    /// "public" or "confidential"
    pub client_type: String,
    /// JSON array of allowed redirect URIs
    pub redirect_uris: String,
    /// Space-separated list of allowed grant types
    pub grant_types: String,
    /// Space-separated list of allowed scopes
    pub allowed_scopes: String,
    /// Space-separated scopes used when a request names none
    pub default_scopes: String,
    pub require_pkce: bool,
    pub require_consent: bool,
    pub first_party: bool,
    /// Access token lifetime in seconds
    pub access_token_ttl: i64,
    /// Refresh token lifetime in seconds
    pub refresh_token_ttl: i64,
    /// ID token lifetime in seconds
    pub id_token_ttl: i64,
    pub is_active: bool,
    /// Owning application tenant
    pub owner_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URIs from JSON string
    pub fn redirect_uris_list(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    pub fn grant_types_list(&self) -> Vec<String> {
        self.grant_types
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn allowed_scopes_list(&self) -> Vec<String> {
        self.allowed_scopes
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn default_scopes_list(&self) -> Vec<String> {
        self.default_scopes
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    /// Exact-match check against the registered redirect URIs
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris_list()
            .iter()
            .any(|allowed| allowed == uri)
    }

    pub fn is_grant_type_allowed(&self, grant_type: &str) -> bool {
        self.grant_types_list().iter().any(|g| g == grant_type)
    }

    pub fn is_public(&self) -> bool {
        self.client_type == CLIENT_TYPE_PUBLIC
    }

    /// Public clients always need PKCE, confidential ones only when flagged.
    pub fn pkce_required(&self) -> bool {
        self.require_pkce || self.is_public()
    }

    pub fn needs_consent(&self) -> bool {
        self.require_consent && !self.first_party
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Model {
        let now = OffsetDateTime::now_utc();
        Model {
            id: "c1".into(),
            client_id: "agw_test".into(),
            client_secret_hash: None,
            name: "Test".into(),
            client_type: CLIENT_TYPE_PUBLIC.into(),
            redirect_uris: r#"["https://app.example/cb","http://localhost:3000/cb"]"#.into(),
            grant_types: "authorization_code refresh_token".into(),
            allowed_scopes: "openid profile email".into(),
            default_scopes: "openid".into(),
            require_pkce: false,
            require_consent: true,
            first_party: false,
            access_token_ttl: 900,
            refresh_token_ttl: 604800,
            id_token_ttl: 3600,
            is_active: true,
            owner_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn redirect_uri_requires_exact_match() {
        let c = client();
        assert!(c.is_redirect_uri_allowed("https://app.example/cb"));
        assert!(!c.is_redirect_uri_allowed("https://app.example/cb/"));
        assert!(!c.is_redirect_uri_allowed("https://evil.example/cb"));
    }

    #[test]
    fn malformed_redirect_uris_allow_nothing() {
        let mut c = client();
        c.redirect_uris = "not json".into();
        assert!(c.redirect_uris_list().is_empty());
    }

    #[test]
    fn public_clients_always_require_pkce() {
        let mut c = client();
        assert!(c.pkce_required());
        c.client_type = CLIENT_TYPE_CONFIDENTIAL.into();
        assert!(!c.pkce_required());
        c.require_pkce = true;
        assert!(c.pkce_required());
    }

    #[test]
    fn first_party_clients_skip_consent() {
        let mut c = client();
        assert!(c.needs_consent());
        c.first_party = true;
        assert!(!c.needs_consent());
    }
}
