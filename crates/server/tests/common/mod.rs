//! Shared fixtures: an in-memory SQLite schema and a fully wired
//! [`AppResources`].

#![allow(dead_code)]

use auth_gateway::{
    AppResources,
    config::{AppConfig, JwtConfig, RetryConfig},
    oauth2::{CreateClient, RegisteredClient},
    rbac::{CreatePermission, CreateRole},
};
use auth_gateway::entity::user;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    Statement,
};
use time::OffsetDateTime;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const ISSUER: &str = "https://auth.example.com";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        username TEXT NULL,
        full_name TEXT NULL,
        email_verified INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_client (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL UNIQUE,
        client_secret_hash TEXT NULL,
        name TEXT NOT NULL,
        client_type TEXT NOT NULL,
        redirect_uris TEXT NOT NULL,
        grant_types TEXT NOT NULL,
        allowed_scopes TEXT NOT NULL,
        default_scopes TEXT NOT NULL,
        require_pkce INTEGER NOT NULL DEFAULT 0,
        require_consent INTEGER NOT NULL DEFAULT 1,
        first_party INTEGER NOT NULL DEFAULT 0,
        access_token_ttl INTEGER NOT NULL,
        refresh_token_ttl INTEGER NOT NULL,
        id_token_ttl INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        owner_id TEXT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_authorization_code (
        id TEXT PRIMARY KEY,
        code_hash TEXT NOT NULL UNIQUE,
        client_id TEXT NOT NULL REFERENCES oauth2_client(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        redirect_uri TEXT NOT NULL,
        scope TEXT NOT NULL,
        nonce TEXT NULL,
        code_challenge TEXT NULL,
        code_challenge_method TEXT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_device_code (
        id TEXT PRIMARY KEY,
        device_code_hash TEXT NOT NULL UNIQUE,
        user_code TEXT NOT NULL UNIQUE,
        client_id TEXT NOT NULL REFERENCES oauth2_client(id) ON DELETE CASCADE,
        scope TEXT NOT NULL,
        status TEXT NOT NULL,
        user_id TEXT NULL,
        interval INTEGER NOT NULL,
        last_polled_at TEXT NULL,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_access_token (
        id TEXT PRIMARY KEY,
        token_hash TEXT NOT NULL UNIQUE,
        client_id TEXT NOT NULL REFERENCES oauth2_client(id) ON DELETE CASCADE,
        user_id TEXT NULL,
        scope TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        revoked_at TEXT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_refresh_token (
        id TEXT PRIMARY KEY,
        token_hash TEXT NOT NULL UNIQUE,
        access_token_id TEXT NOT NULL,
        client_id TEXT NOT NULL REFERENCES oauth2_client(id) ON DELETE CASCADE,
        user_id TEXT NULL,
        scope TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        revoked_at TEXT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE oauth2_consent (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        client_id TEXT NOT NULL REFERENCES oauth2_client(id) ON DELETE CASCADE,
        scopes TEXT NOT NULL,
        granted_at TEXT NOT NULL,
        revoked_at TEXT NULL,
        UNIQUE (user_id, client_id)
    );"#,
    r#"CREATE TABLE user_session (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        client_id TEXT NULL,
        token_hash TEXT NOT NULL UNIQUE,
        access_token_hash TEXT NULL,
        ip_address TEXT NULL,
        user_agent TEXT NULL,
        session_name TEXT NULL,
        expires_at TEXT NOT NULL,
        revoked_at TEXT NULL,
        last_active_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE token_blacklist (
        token_hash TEXT PRIMARY KEY,
        user_id TEXT NULL,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE role (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        description TEXT NULL,
        is_system_role INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE permission (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        resource TEXT NOT NULL,
        action TEXT NOT NULL,
        description TEXT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE role_permission (
        role_id TEXT NOT NULL REFERENCES role(id) ON DELETE CASCADE,
        permission_id TEXT NOT NULL REFERENCES permission(id) ON DELETE CASCADE,
        granted_at TEXT NOT NULL,
        PRIMARY KEY (role_id, permission_id)
    );"#,
    r#"CREATE TABLE user_role (
        user_id TEXT NOT NULL,
        role_id TEXT NOT NULL REFERENCES role(id) ON DELETE CASCADE,
        assigned_at TEXT NOT NULL,
        assigned_by TEXT NULL,
        PRIMARY KEY (user_id, role_id)
    );"#,
];

/// Create a test database with every table the gateway uses.
pub async fn create_test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    for stmt in SCHEMA {
        db.execute(Statement::from_string(DbBackend::Sqlite, *stmt))
            .await
            .expect("create table");
    }
    db
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        issuer_url: ISSUER.to_string(),
        expose_error_details: true,
        internal_api_token: None,
        jwt: JwtConfig {
            secret: "test-secret-test-secret-test-secret!".to_string(),
            issuer: None,
        },
        session: Default::default(),
        oauth2: Default::default(),
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        sweep: Default::default(),
        rate_limit: Default::default(),
        rbac: Default::default(),
    }
}

pub async fn setup_with(config: AppConfig) -> AppResources {
    let db = Arc::new(create_test_db().await);
    AppResources::new(db, config, CancellationToken::new())
}

pub async fn setup() -> AppResources {
    setup_with(test_config()).await
}

pub async fn insert_user(db: &DatabaseConnection, id: &str, email: &str) {
    let now = OffsetDateTime::now_utc();
    user::ActiveModel {
        id: Set(id.to_string()),
        email: Set(email.to_string()),
        username: Set(Some(id.to_string())),
        full_name: Set(Some(format!("User {id}"))),
        email_verified: Set(true),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert user");
}

pub async fn deactivate_user(db: &DatabaseConnection, id: &str) {
    db.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "UPDATE users SET is_active = 0 WHERE id = ?;",
        [id.into()],
    ))
    .await
    .expect("deactivate user");
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn client_request(client_type: &str, grant_types: &[&str]) -> CreateClient {
    CreateClient {
        name: format!("{client_type} test client"),
        client_type: client_type.to_string(),
        redirect_uris: vec![REDIRECT_URI.to_string()],
        grant_types: strings(grant_types),
        allowed_scopes: strings(&["openid", "profile", "email", "offline_access", "api"]),
        default_scopes: strings(&["openid"]),
        require_pkce: false,
        require_consent: false,
        first_party: false,
        access_token_ttl: None,
        refresh_token_ttl: None,
        id_token_ttl: None,
        owner_id: None,
    }
}

pub async fn public_client(resources: &AppResources) -> RegisteredClient {
    resources
        .oauth
        .create_client(client_request(
            "public",
            &["authorization_code", "refresh_token", "urn:ietf:params:oauth:grant-type:device_code"],
        ))
        .await
        .expect("create public client")
}

pub async fn confidential_client(resources: &AppResources) -> RegisteredClient {
    resources
        .oauth
        .create_client(client_request(
            "confidential",
            &["authorization_code", "refresh_token", "client_credentials"],
        ))
        .await
        .expect("create confidential client")
}

/// A role named `name` holding one `resource:action` permission per entry,
/// assigned to `user_id`. Returns the role id.
pub async fn grant_role(
    resources: &AppResources,
    user_id: &str,
    name: &str,
    permissions: &[(&str, &str)],
) -> String {
    let mut ids = Vec::new();
    for (resource, action) in permissions {
        let perm_name = format!("{resource}:{action}");
        let existing = resources
            .rbac
            .get_permission_by_name(&perm_name)
            .await
            .expect("lookup permission");
        let perm = match existing {
            Some(p) => p,
            None => resources
                .rbac
                .create_permission(CreatePermission {
                    name: perm_name,
                    resource: resource.to_string(),
                    action: action.to_string(),
                    description: None,
                })
                .await
                .expect("create permission"),
        };
        ids.push(perm.id);
    }
    let role = resources
        .rbac
        .create_role(CreateRole {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            description: None,
            permissions: ids,
        })
        .await
        .expect("create role");
    resources
        .rbac
        .assign_role_to_user(user_id, &role.id, None)
        .await
        .expect("assign role");
    role.id
}
