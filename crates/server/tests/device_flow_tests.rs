//! Device authorization grant: polling, user decisions, expiry.

mod common;

use auth_gateway::entity::oauth2_device_code;
use auth_gateway::error::ServiceError;
use auth_gateway::oauth2::{GRANT_DEVICE_CODE, OAuthError, TokenRequest};
use common::{confidential_client, insert_user, public_client, setup};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use time::{Duration, OffsetDateTime};

fn poll(client_id: &str, device_code: &str) -> TokenRequest {
    TokenRequest {
        grant_type: GRANT_DEVICE_CODE.to_string(),
        client_id: Some(client_id.to_string()),
        device_code: Some(device_code.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_device_authorization_response() {
    let resources = setup().await;
    let client = public_client(&resources).await;

    let auth = resources
        .oauth
        .device_authorization(&client.client.client_id, Some("openid profile"))
        .await
        .expect("device authorization");
    assert_eq!(auth.user_code.len(), 9);
    assert_eq!(&auth.user_code[4..5], "-");
    assert!(auth.verification_uri_complete.contains(&auth.user_code));
    assert_eq!(auth.expires_in, resources.config.oauth2.device_code_ttl);
    assert_eq!(auth.interval, resources.config.oauth2.device_poll_interval);
}

#[tokio::test]
async fn test_device_grant_requires_allowed_client() {
    let resources = setup().await;
    let client = confidential_client(&resources).await;
    let result = resources
        .oauth
        .device_authorization(&client.client.client_id, None)
        .await;
    assert!(matches!(result, Err(OAuthError::UnauthorizedClient(_))));
}

#[tokio::test]
async fn test_pending_then_slow_down() {
    let resources = setup().await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let auth = resources
        .oauth
        .device_authorization(&client_id, None)
        .await
        .expect("device authorization");

    let first = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(first, Err(OAuthError::AuthorizationPending)));

    let second = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(second, Err(OAuthError::SlowDown)));

    let row = oauth2_device_code::Entity::find()
        .filter(oauth2_device_code::Column::UserCode.eq(auth.user_code.as_str()))
        .one(resources.db.as_ref())
        .await
        .expect("query")
        .expect("device row");
    assert_eq!(row.interval, auth.interval + 5);
}

#[tokio::test]
async fn test_approved_code_yields_tokens_once() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let auth = resources
        .oauth
        .device_authorization(&client_id, Some("openid offline_access"))
        .await
        .expect("device authorization");

    // Users type codes loosely.
    let typed = auth.user_code.to_lowercase().replace('-', " ");
    resources
        .oauth
        .approve_device_code("alice", &typed, true)
        .await
        .expect("approve");

    let tokens = resources
        .oauth
        .token(&poll(&client_id, &auth.device_code))
        .await
        .expect("tokens");
    assert!(tokens.refresh_token.is_some());
    assert_eq!(tokens.scope.as_deref(), Some("openid offline_access"));

    let introspection = resources.oauth.introspect(&tokens.access_token, None).await;
    assert!(introspection.active);
    assert_eq!(introspection.sub.as_deref(), Some("alice"));

    let again = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(again, Err(OAuthError::InvalidGrant(_))));

    let decided_twice = resources
        .oauth
        .approve_device_code("alice", &auth.user_code, true)
        .await;
    assert!(matches!(decided_twice, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn test_denied_code() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let auth = resources
        .oauth
        .device_authorization(&client_id, None)
        .await
        .expect("device authorization");

    resources
        .oauth
        .approve_device_code("alice", &auth.user_code, false)
        .await
        .expect("deny");

    let result = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(result, Err(OAuthError::AccessDenied(_))));
}

#[tokio::test]
async fn test_expired_code() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let auth = resources
        .oauth
        .device_authorization(&client_id, None)
        .await
        .expect("device authorization");

    oauth2_device_code::Entity::update_many()
        .col_expr(
            oauth2_device_code::Column::ExpiresAt,
            Expr::value(OffsetDateTime::now_utc() - Duration::minutes(1)),
        )
        .filter(oauth2_device_code::Column::UserCode.eq(auth.user_code.as_str()))
        .exec(resources.db.as_ref())
        .await
        .expect("expire device code");

    let approve = resources
        .oauth
        .approve_device_code("alice", &auth.user_code, true)
        .await;
    assert!(matches!(approve, Err(ServiceError::Validation(_))));

    let result = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(result, Err(OAuthError::ExpiredToken)));
    // Marked expired, so the answer is stable.
    let again = resources.oauth.token(&poll(&client_id, &auth.device_code)).await;
    assert!(matches!(again, Err(OAuthError::ExpiredToken)));
}

#[tokio::test]
async fn test_unknown_code_and_wrong_client() {
    let resources = setup().await;
    let client = public_client(&resources).await;
    let other = public_client(&resources).await;
    let auth = resources
        .oauth
        .device_authorization(&client.client.client_id, None)
        .await
        .expect("device authorization");

    let unknown = resources
        .oauth
        .token(&poll(&client.client.client_id, "no-such-device-code"))
        .await;
    assert!(matches!(unknown, Err(OAuthError::InvalidGrant(_))));

    let stolen = resources
        .oauth
        .token(&poll(&other.client.client_id, &auth.device_code))
        .await;
    assert!(matches!(stolen, Err(OAuthError::InvalidGrant(_))));

    let missing_user_code = resources
        .oauth
        .approve_device_code("alice", "ZZZZ-ZZZZ", true)
        .await;
    assert!(matches!(missing_user_code, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_concurrent_polls_claim_an_approved_code_once() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let auth = resources
        .oauth
        .device_authorization(&client_id, None)
        .await
        .expect("device authorization");
    resources
        .oauth
        .approve_device_code("alice", &auth.user_code, true)
        .await
        .expect("approve");

    let request = poll(&client_id, &auth.device_code);
    let (a, b) = tokio::join!(
        resources.oauth.token(&request),
        resources.oauth.token(&request)
    );
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one poll receives tokens"
    );
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(OAuthError::InvalidGrant(_))));

    let row = oauth2_device_code::Entity::find()
        .filter(oauth2_device_code::Column::UserCode.eq(auth.user_code.as_str()))
        .one(resources.db.as_ref())
        .await
        .expect("query")
        .expect("device row");
    assert_eq!(row.status.as_str(), "consumed");
}
