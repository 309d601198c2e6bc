use serde::Serialize;
use utoipa::ToSchema;

use super::pkce::ChallengeMethod;
use super::scope::{SCOPE_EMAIL, SCOPE_OFFLINE_ACCESS, SCOPE_OPENID, SCOPE_PROFILE};
use super::OAuthServer;
use super::grants::KNOWN_GRANT_TYPES;

/// OpenID Connect discovery document.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    pub device_authorization_endpoint: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub claims_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl OAuthServer {
    pub fn discovery_document(&self) -> DiscoveryDocument {
        let base = &self.base_url;
        let mut pkce_methods = vec![ChallengeMethod::S256.to_string()];
        if self.config.allow_plain_pkce {
            pkce_methods.push(ChallengeMethod::Plain.to_string());
        }
        DiscoveryDocument {
            issuer: self.issuer.clone(),
            authorization_endpoint: format!("{base}/oauth2/authorize"),
            token_endpoint: format!("{base}/oauth2/token"),
            userinfo_endpoint: format!("{base}/oauth2/userinfo"),
            jwks_uri: format!("{base}/.well-known/jwks.json"),
            revocation_endpoint: format!("{base}/oauth2/revoke"),
            introspection_endpoint: format!("{base}/oauth2/introspect"),
            device_authorization_endpoint: format!("{base}/oauth2/device/code"),
            scopes_supported: strings(&[
                SCOPE_OPENID,
                SCOPE_PROFILE,
                SCOPE_EMAIL,
                SCOPE_OFFLINE_ACCESS,
            ]),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&KNOWN_GRANT_TYPES),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: vec![self.signer.algorithm().to_string()],
            code_challenge_methods_supported: pkce_methods,
            claims_supported: strings(&[
                "sub",
                "iss",
                "aud",
                "exp",
                "iat",
                "nonce",
                "email",
                "email_verified",
                "name",
                "preferred_username",
            ]),
        }
    }

    /// Public signing keys. Empty for symmetric signers.
    pub fn jwks(&self) -> serde_json::Value {
        self.signer.jwks()
    }
}
