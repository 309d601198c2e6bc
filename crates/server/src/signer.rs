//! Signing seam for self-verifying tokens.
//!
//! Session access tokens and OIDC ID tokens are JWTs. The gateway only needs
//! sign and verify, so the algorithm sits behind [`TokenSigner`]; the default
//! is HS256 with the configured secret.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("token signing failed: {0}")]
    Sign(String),
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Claims carried by a first-party session access token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    /// Session id
    pub sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    /// Public client id
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

pub trait TokenSigner: Send + Sync {
    fn sign_access(&self, claims: &AccessClaims) -> Result<String, SignerError>;
    fn verify_access(&self, token: &str) -> Result<AccessClaims, SignerError>;
    fn sign_id_token(&self, claims: &IdTokenClaims) -> Result<String, SignerError>;
    /// Public keys for `/.well-known/jwks.json`.
    fn jwks(&self) -> serde_json::Value;
    fn algorithm(&self) -> &'static str;
}

/// HS256 signer. Symmetric keys are never published, so its JWKS is empty.
pub struct HmacSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl HmacSigner {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation
    }
}

impl TokenSigner for HmacSigner {
    fn sign_access(&self, claims: &AccessClaims) -> Result<String, SignerError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| SignerError::Sign(e.to_string()))
    }

    fn verify_access(&self, token: &str) -> Result<AccessClaims, SignerError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SignerError::Expired,
                _ => SignerError::Invalid(e.to_string()),
            })
    }

    fn sign_id_token(&self, claims: &IdTokenClaims) -> Result<String, SignerError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| SignerError::Sign(e.to_string()))
    }

    fn jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": [] })
    }

    fn algorithm(&self) -> &'static str {
        "HS256"
    }
}
