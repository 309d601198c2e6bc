use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret for session access tokens and ID tokens
    pub secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_access_ttl")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_session_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,
    /// Check the durable blacklist when the in-process cache has no entry.
    #[serde(default = "default_true")]
    pub blacklist_db_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: default_session_access_ttl(),
            refresh_token_ttl_secs: default_session_refresh_ttl(),
            blacklist_db_fallback: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OAuth2Config {
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: i64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: i64,
    #[serde(default = "default_id_token_ttl")]
    pub id_token_ttl: i64,
    #[serde(default = "default_auth_code_ttl")]
    pub authorization_code_ttl: i64,
    #[serde(default = "default_device_code_ttl")]
    pub device_code_ttl: i64,
    /// Minimum seconds between device polls
    #[serde(default = "default_device_interval")]
    pub device_poll_interval: i64,
    /// Page where users enter device user codes. Defaults to `{issuer_url}/device`.
    #[serde(default)]
    pub device_verification_uri: Option<String>,
    /// Accept `code_challenge_method=plain`
    #[serde(default)]
    pub allow_plain_pkce: bool,
    /// Record a first-party session for tokens issued to a user
    #[serde(default = "default_true")]
    pub link_sessions: bool,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            access_token_ttl: default_access_token_ttl(),
            refresh_token_ttl: default_refresh_token_ttl(),
            id_token_ttl: default_id_token_ttl(),
            authorization_code_ttl: default_auth_code_ttl(),
            device_code_ttl: default_device_code_ttl(),
            device_poll_interval: default_device_interval(),
            device_verification_uri: None,
            allow_plain_pkce: false,
            link_sessions: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per unit of work
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Revoked or expired sessions are kept this long before deletion
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            session_retention_days: default_session_retention_days(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    /// Token endpoint requests allowed per client per window
    #[serde(default = "default_rate_max")]
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_rate_window(),
            max_requests: default_rate_max(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RbacConfig {
    /// Role whose last holder cannot be removed
    #[serde(default = "default_admin_role")]
    pub admin_role_name: String,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            admin_role_name: default_admin_role(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public base URL, used as `iss` and for discovery
    pub issuer_url: String,
    /// Include internal error details in responses
    #[serde(default)]
    pub expose_error_details: bool,
    /// Shared secret required on `/internal/*`. Unset leaves them open.
    #[serde(default)]
    pub internal_api_token: Option<String>,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub oauth2: OAuth2Config,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rbac: RbacConfig,
}

fn default_true() -> bool {
    true
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_session_access_ttl() -> i64 {
    900
}
fn default_session_refresh_ttl() -> i64 {
    86400 * 7
}
fn default_access_token_ttl() -> i64 {
    900
}
fn default_refresh_token_ttl() -> i64 {
    86400 * 7
}
fn default_id_token_ttl() -> i64 {
    3600
}
fn default_auth_code_ttl() -> i64 {
    600
}
fn default_device_code_ttl() -> i64 {
    900
}
fn default_device_interval() -> i64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2000
}
fn default_sweep_interval() -> u64 {
    3600
}
fn default_session_retention_days() -> i64 {
    7
}
fn default_rate_window() -> u64 {
    60
}
fn default_rate_max() -> u64 {
    60
}
fn default_admin_role() -> String {
    "admin".to_string()
}

impl AppConfig {
    /// The `iss` value placed in tokens.
    pub fn issuer(&self) -> &str {
        self.jwt.issuer.as_deref().unwrap_or(&self.issuer_url)
    }

    pub fn device_verification_uri(&self) -> String {
        match &self.oauth2.device_verification_uri {
            Some(uri) => uri.clone(),
            None => format!("{}/device", self.issuer_url.trim_end_matches('/')),
        }
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::Validation(
                "jwt.secret must be at least 32 characters".into(),
            ));
        }
        if self.issuer_url.is_empty() {
            return Err(ConfigError::Validation("issuer_url must be set".into()));
        }
        let ttls = [
            ("session.access_token_ttl_secs", self.session.access_token_ttl_secs),
            ("session.refresh_token_ttl_secs", self.session.refresh_token_ttl_secs),
            ("oauth2.access_token_ttl", self.oauth2.access_token_ttl),
            ("oauth2.refresh_token_ttl", self.oauth2.refresh_token_ttl),
            ("oauth2.id_token_ttl", self.oauth2.id_token_ttl),
            ("oauth2.authorization_code_ttl", self.oauth2.authorization_code_ttl),
            ("oauth2.device_code_ttl", self.oauth2.device_code_ttl),
            ("oauth2.device_poll_interval", self.oauth2.device_poll_interval),
        ];
        for (name, value) in ttls {
            if value <= 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Validation("retry.max_retries must be >= 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Validation(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.window_secs must be > 0".into(),
            ));
        }
        if self
            .internal_api_token
            .as_deref()
            .is_some_and(|t| t.len() < 16)
        {
            return Err(ConfigError::Validation(
                "internal_api_token must be at least 16 characters".into(),
            ));
        }
        if self.rbac.admin_role_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "rbac.admin_role_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `OAUTH2__ACCESS_TOKEN_TTL`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, FileFormat};

    fn parse(yaml: &str) -> AppConfig {
        Config::builder()
            .add_source(config::File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
database_url: "sqlite::memory:"
issuer_url: "https://auth.example.com"
jwt:
  secret: "0123456789abcdef0123456789abcdef"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(MINIMAL);
        cfg.validate().unwrap();
        assert_eq!(cfg.oauth2.access_token_ttl, 900);
        assert_eq!(cfg.oauth2.refresh_token_ttl, 604800);
        assert_eq!(cfg.oauth2.device_poll_interval, 5);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.initial_backoff_ms, 100);
        assert_eq!(cfg.rbac.admin_role_name, "admin");
        assert!(!cfg.oauth2.allow_plain_pkce);
        assert!(!cfg.expose_error_details);
        assert_eq!(cfg.issuer(), "https://auth.example.com");
        assert_eq!(
            cfg.device_verification_uri(),
            "https://auth.example.com/device"
        );
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.jwt.secret = "short".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.oauth2.device_code_ttl = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("oauth2.device_code_ttl"));
    }

    #[test]
    fn backoff_bounds_are_checked() {
        let mut cfg = parse(MINIMAL);
        cfg.retry.initial_backoff_ms = 5000;
        assert!(cfg.validate().is_err());
    }
}
