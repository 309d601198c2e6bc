use auth_gateway::config::{AppConfig, ConfigError, OAuth2Config};
use config::Config;
use std::env;
use std::fs;

fn from_yaml<T: serde::de::DeserializeOwned>(yaml: &str) -> Result<T, config::ConfigError> {
    Config::builder()
        .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
        .build()?
        .try_deserialize()
}

#[test]
fn test_oauth2_config_deserialization() {
    let yaml_content = r#"
access_token_ttl: 300
device_poll_interval: 10
device_verification_uri: "https://login.example.com/activate"
allow_plain_pkce: true
"#;

    let oauth2: OAuth2Config = from_yaml(yaml_content).expect("Failed to deserialize OAuth2 config");
    assert_eq!(oauth2.access_token_ttl, 300);
    assert_eq!(oauth2.device_poll_interval, 10);
    assert!(oauth2.allow_plain_pkce);
    // Unset fields keep their defaults
    assert_eq!(oauth2.authorization_code_ttl, 600);
    assert!(oauth2.link_sessions);
}

#[test]
fn test_app_config_deserialization() {
    let yaml_content = r#"
database_url: "postgres://localhost/auth"
listen_addr: "127.0.0.1:9000"
issuer_url: "https://auth.example.com/"
internal_api_token: "0123456789abcdef-internal"
jwt:
  secret: "0123456789abcdef0123456789abcdef"
  issuer: "https://issuer.example.com"
session:
  access_token_ttl_secs: 600
oauth2:
  device_verification_uri: "https://login.example.com/activate"
sweep:
  enabled: false
rate_limit:
  max_requests: 10
rbac:
  admin_role_name: "superuser"
"#;

    let app_config: AppConfig = from_yaml(yaml_content).expect("Failed to deserialize app config");
    app_config.validate().expect("valid config");
    assert_eq!(app_config.database_url, "postgres://localhost/auth");
    assert_eq!(app_config.listen_addr, "127.0.0.1:9000");
    assert_eq!(app_config.issuer(), "https://issuer.example.com");
    assert_eq!(app_config.session.access_token_ttl_secs, 600);
    assert_eq!(app_config.session.refresh_token_ttl_secs, 604800);
    assert!(!app_config.sweep.enabled);
    assert_eq!(app_config.rate_limit.max_requests, 10);
    assert_eq!(app_config.rbac.admin_role_name, "superuser");
    assert_eq!(
        app_config.device_verification_uri(),
        "https://login.example.com/activate"
    );
}

#[test]
fn test_config_with_environment_variables() {
    let temp_dir = env::temp_dir();
    let config_path = temp_dir.join("auth_gateway_test_config.yaml");
    let config_content = r#"
database_url: "postgres://file/auth"
issuer_url: "https://file.example.com"
jwt:
  secret: "file-secret-file-secret-file-secret!"
oauth2:
  access_token_ttl: 900
"#;
    fs::write(&config_path, config_content).expect("Failed to write temp config");

    unsafe {
        env::set_var("AGWTEST__DATABASE_URL", "postgres://env/auth");
        env::set_var("AGWTEST__OAUTH2__ACCESS_TOKEN_TTL", "120");

        let config = Config::builder()
            .add_source(config::File::from(config_path.clone()))
            .add_source(
                config::Environment::with_prefix("AGWTEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .expect("Failed to build config");

        let app_config: AppConfig = config.try_deserialize().expect("Failed to deserialize");

        assert_eq!(app_config.database_url, "postgres://env/auth");
        assert_eq!(app_config.oauth2.access_token_ttl, 120);
        assert_eq!(app_config.issuer_url, "https://file.example.com");

        env::remove_var("AGWTEST__DATABASE_URL");
        env::remove_var("AGWTEST__OAUTH2__ACCESS_TOKEN_TTL");
        let _ = fs::remove_file(config_path);
    }
}

#[test]
fn test_short_internal_token_is_rejected() {
    let yaml_content = r#"
database_url: "sqlite::memory:"
issuer_url: "https://auth.example.com"
internal_api_token: "short"
jwt:
  secret: "0123456789abcdef0123456789abcdef"
"#;

    let app_config: AppConfig = from_yaml(yaml_content).expect("Failed to deserialize");
    let err = app_config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("internal_api_token"));
}

#[test]
fn test_config_partial_structure() {
    let invalid_yaml = r#"
database_url: "postgres://localhost/auth"
# Missing issuer_url and jwt
"#;

    let result: Result<AppConfig, _> = from_yaml(invalid_yaml);
    assert!(
        result.is_err(),
        "Should fail when required fields are missing"
    );
}
