//! OAuth2 authorization server flows against an in-memory database.

mod common;

use auth_gateway::credential::hash_token;
use auth_gateway::entity::oauth2_access_token;
use auth_gateway::error::ServiceError;
use auth_gateway::oauth2::pkce;
use auth_gateway::oauth2::{AuthorizeRequest, OAuthError, TokenRequest, TokenResponse};
use auth_gateway::signer::IdTokenClaims;
use auth_gateway::AppResources;
use common::{REDIRECT_URI, client_request, confidential_client, insert_user, public_client, setup};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use time::{Duration, OffsetDateTime};

const VERIFIER: &str = "dBjftJeZ4CVP-mJ92K27uhbUJU1p1r_wW1gFWFOEjXk-extra-entropy";

fn authorize_request(client_id: &str, scope: &str) -> AuthorizeRequest {
    AuthorizeRequest {
        response_type: "code".to_string(),
        client_id: client_id.to_string(),
        redirect_uri: Some(REDIRECT_URI.to_string()),
        scope: Some(scope.to_string()),
        state: Some("xyz".to_string()),
        nonce: Some("n-0S6_WzA2Mj".to_string()),
        code_challenge: Some(pkce::s256_challenge(VERIFIER)),
        code_challenge_method: Some("S256".to_string()),
    }
}

fn code_exchange(client_id: &str, code: &str, verifier: Option<&str>) -> TokenRequest {
    TokenRequest {
        grant_type: "authorization_code".to_string(),
        code: Some(code.to_string()),
        redirect_uri: Some(REDIRECT_URI.to_string()),
        client_id: Some(client_id.to_string()),
        code_verifier: verifier.map(str::to_string),
        ..Default::default()
    }
}

fn refresh_grant(client_id: &str, refresh_token: &str) -> TokenRequest {
    TokenRequest {
        grant_type: "refresh_token".to_string(),
        client_id: Some(client_id.to_string()),
        refresh_token: Some(refresh_token.to_string()),
        ..Default::default()
    }
}

fn client_credentials(client_id: &str, secret: &str) -> TokenRequest {
    TokenRequest {
        grant_type: "client_credentials".to_string(),
        client_id: Some(client_id.to_string()),
        client_secret: Some(secret.to_string()),
        scope: Some("api".to_string()),
        ..Default::default()
    }
}

/// Authorize `alice` for `client_id` and redeem the code.
async fn login(resources: &AppResources, client_id: &str) -> TokenResponse {
    let grant = resources
        .oauth
        .authorize("alice", authorize_request(client_id, "openid"))
        .await
        .expect("authorize");
    resources
        .oauth
        .token(&code_exchange(client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange")
}

#[tokio::test]
async fn test_authorization_code_is_exchanged_once() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid profile"))
        .await
        .expect("authorize");
    assert_eq!(grant.state.as_deref(), Some("xyz"));
    let redirect = grant.redirect_url().expect("redirect url");
    assert!(redirect.starts_with(REDIRECT_URI));
    assert!(redirect.contains("state=xyz"));

    let tokens = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange");
    assert_eq!(tokens.token_type, "Bearer");
    assert!(tokens.refresh_token.is_some());
    assert!(tokens.id_token.is_some(), "openid scope yields an ID token");
    assert_eq!(tokens.scope.as_deref(), Some("openid profile"));

    let replay = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
        .await;
    assert!(matches!(replay, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_wrong_or_missing_verifier_is_rejected() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid"))
        .await
        .expect("authorize");

    let missing = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, None))
        .await;
    assert!(missing.is_err());

    let wrong = resources
        .oauth
        .token(&code_exchange(
            &client_id,
            &grant.code,
            Some("wrong-verifier-wrong-verifier-wrong-verifier-00"),
        ))
        .await;
    assert!(matches!(wrong, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_public_client_must_send_challenge() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;

    let mut req = authorize_request(&client.client.client_id, "openid");
    req.code_challenge = None;
    req.code_challenge_method = None;
    let result = resources.oauth.authorize("alice", req).await;
    assert!(matches!(result, Err(OAuthError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_unregistered_redirect_and_scope_are_rejected() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;

    let mut req = authorize_request(&client.client.client_id, "openid");
    req.redirect_uri = Some("https://evil.example.com/cb".to_string());
    let result = resources.oauth.authorize("alice", req).await;
    assert!(matches!(result, Err(OAuthError::InvalidRequest(_))));

    let req = authorize_request(&client.client.client_id, "openid admin");
    let result = resources.oauth.authorize("alice", req).await;
    assert!(matches!(result, Err(OAuthError::InvalidScope(_))));
}

#[tokio::test]
async fn test_consent_required_until_granted() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let mut req = client_request("public", &["authorization_code", "refresh_token"]);
    req.require_consent = true;
    let client = resources.oauth.create_client(req).await.expect("create client");
    let client_id = client.client.client_id.clone();

    let first = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid email"))
        .await;
    assert!(matches!(first, Err(OAuthError::ConsentRequired)));

    resources
        .oauth
        .grant_consent(
            "alice",
            &client_id,
            &["openid".to_string(), "email".to_string()],
        )
        .await
        .expect("grant consent");

    resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid email"))
        .await
        .expect("authorize after consent");

    // Consent does not stretch to scopes never granted.
    let broader = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid email profile"))
        .await;
    assert!(matches!(broader, Err(OAuthError::ConsentRequired)));
}

#[tokio::test]
async fn test_client_credentials_requires_secret() {
    let resources = setup().await;
    let client = confidential_client(&resources).await;
    let secret = client.client_secret.clone().expect("confidential secret");

    let tokens = resources
        .oauth
        .token(&TokenRequest {
            grant_type: "client_credentials".to_string(),
            client_id: Some(client.client.client_id.clone()),
            client_secret: Some(secret),
            scope: Some("api".to_string()),
            ..Default::default()
        })
        .await
        .expect("client credentials");
    assert!(tokens.refresh_token.is_none(), "no user means no refresh token");
    assert!(tokens.id_token.is_none());

    let without = resources
        .oauth
        .token(&TokenRequest {
            grant_type: "client_credentials".to_string(),
            client_id: Some(client.client.client_id.clone()),
            ..Default::default()
        })
        .await;
    assert!(matches!(without, Err(OAuthError::InvalidClient(_))));

    let wrong = resources
        .oauth
        .token(&TokenRequest {
            grant_type: "client_credentials".to_string(),
            client_id: Some(client.client.client_id.clone()),
            client_secret: Some("agws_not-the-secret".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(wrong, Err(OAuthError::InvalidClient(_))));
}

#[tokio::test]
async fn test_unknown_grant_type() {
    let resources = setup().await;
    let result = resources
        .oauth
        .token(&TokenRequest {
            grant_type: "password".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(OAuthError::UnsupportedGrantType(_))));
}

#[tokio::test]
async fn test_refresh_token_rotates_and_replay_fails() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid profile email"))
        .await
        .expect("authorize");
    let first = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange");
    let old_refresh = first.refresh_token.clone().expect("refresh token");

    let refresh = |scope: Option<&str>| TokenRequest {
        grant_type: "refresh_token".to_string(),
        client_id: Some(client_id.clone()),
        refresh_token: Some(old_refresh.clone()),
        scope: scope.map(str::to_string),
        ..Default::default()
    };

    let widened = resources.oauth.token(&refresh(Some("openid api"))).await;
    assert!(matches!(widened, Err(OAuthError::InvalidScope(_))));

    let second = resources
        .oauth
        .token(&refresh(Some("openid email")))
        .await
        .expect("refresh");
    assert_ne!(second.access_token, first.access_token);
    assert_ne!(second.refresh_token, first.refresh_token);
    assert_eq!(second.scope.as_deref(), Some("openid email"));

    // The access token issued alongside the used refresh token is gone.
    let old = resources.oauth.introspect(&first.access_token, None).await;
    assert!(!old.active);

    let replay = resources.oauth.token(&refresh(None)).await;
    assert!(matches!(replay, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_refresh_token_bound_to_its_client() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let other = public_client(&resources).await;

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client.client.client_id, "openid"))
        .await
        .expect("authorize");
    let tokens = resources
        .oauth
        .token(&code_exchange(&client.client.client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange");

    let stolen = resources
        .oauth
        .token(&TokenRequest {
            grant_type: "refresh_token".to_string(),
            client_id: Some(other.client.client_id.clone()),
            refresh_token: tokens.refresh_token.clone(),
            ..Default::default()
        })
        .await;
    assert!(matches!(stolen, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_introspect_and_revoke() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid"))
        .await
        .expect("authorize");
    let tokens = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange");

    let active = resources.oauth.introspect(&tokens.access_token, None).await;
    assert!(active.active);
    assert_eq!(active.sub.as_deref(), Some("alice"));
    assert_eq!(active.client_id.as_deref(), Some(client_id.as_str()));
    assert_eq!(active.scope.as_deref(), Some("openid"));

    let refresh = tokens.refresh_token.clone().expect("refresh token");
    let refresh_view = resources
        .oauth
        .introspect(&refresh, Some("refresh_token"))
        .await;
    assert!(refresh_view.active);

    resources
        .oauth
        .revoke_token(&tokens.access_token, None)
        .await
        .expect("revoke");
    assert!(!resources.oauth.introspect(&tokens.access_token, None).await.active);

    // Unknown tokens revoke quietly and introspect as inactive.
    resources
        .oauth
        .revoke_token("not-a-real-token", None)
        .await
        .expect("revoke unknown");
    let unknown = resources.oauth.introspect("not-a-real-token", None).await;
    assert!(!unknown.active);
    assert!(unknown.sub.is_none());
}

#[tokio::test]
async fn test_userinfo_claims_follow_scope() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let issue = |scope: &'static str| {
        let resources = resources.clone();
        let client_id = client_id.clone();
        async move {
            let grant = resources
                .oauth
                .authorize("alice", authorize_request(&client_id, scope))
                .await
                .expect("authorize");
            resources
                .oauth
                .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
                .await
                .expect("exchange")
        }
    };

    let narrow = issue("openid").await;
    let info = resources
        .oauth
        .userinfo(&narrow.access_token)
        .await
        .expect("userinfo");
    assert_eq!(info.sub, "alice");
    assert!(info.email.is_none());
    assert!(info.name.is_none());

    let wide = issue("openid profile email").await;
    let info = resources
        .oauth
        .userinfo(&wide.access_token)
        .await
        .expect("userinfo");
    assert_eq!(info.email.as_deref(), Some("alice@example.com"));
    assert_eq!(info.email_verified, Some(true));
    assert_eq!(info.name.as_deref(), Some("User alice"));
    assert_eq!(info.preferred_username.as_deref(), Some("alice"));

    let bogus = resources.oauth.userinfo("bogus").await;
    assert!(matches!(bogus, Err(OAuthError::InvalidToken(_))));
}

#[tokio::test]
async fn test_id_token_carries_nonce() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();

    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid"))
        .await
        .expect("authorize");
    let tokens = resources
        .oauth
        .token(&code_exchange(&client_id, &grant.code, Some(VERIFIER)))
        .await
        .expect("exchange");

    let id_token = tokens.id_token.expect("id token");
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[client_id.as_str()]);
    validation.set_issuer(&[common::ISSUER]);
    let claims = jsonwebtoken::decode::<IdTokenClaims>(
        &id_token,
        &jsonwebtoken::DecodingKey::from_secret(resources.config.jwt.secret.as_bytes()),
        &validation,
    )
    .expect("verify id token")
    .claims;
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.aud, client_id);
    assert_eq!(claims.nonce.as_deref(), Some("n-0S6_WzA2Mj"));
}

#[tokio::test]
async fn test_concurrent_code_exchange_succeeds_once() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let grant = resources
        .oauth
        .authorize("alice", authorize_request(&client_id, "openid"))
        .await
        .expect("authorize");

    let request = code_exchange(&client_id, &grant.code, Some(VERIFIER));
    let (a, b) = tokio::join!(
        resources.oauth.token(&request),
        resources.oauth.token(&request)
    );
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one exchange wins"
    );
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_expired_access_token_introspects_inactive() {
    let resources = setup().await;
    let client = confidential_client(&resources).await;
    let secret = client.client_secret.clone().expect("confidential secret");
    let tokens = resources
        .oauth
        .token(&client_credentials(&client.client.client_id, &secret))
        .await
        .expect("client credentials");
    assert!(resources.oauth.introspect(&tokens.access_token, None).await.active);

    oauth2_access_token::Entity::update_many()
        .col_expr(
            oauth2_access_token::Column::ExpiresAt,
            Expr::value(OffsetDateTime::now_utc() - Duration::seconds(1)),
        )
        .filter(oauth2_access_token::Column::TokenHash.eq(hash_token(&tokens.access_token)))
        .exec(resources.db.as_ref())
        .await
        .expect("expire token");

    let expired = resources.oauth.introspect(&tokens.access_token, None).await;
    assert!(!expired.active);
    assert!(expired.sub.is_none());
    assert!(expired.scope.is_none());
}

#[tokio::test]
async fn test_refresh_revocation_is_idempotent_and_cascades() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let tokens = login(&resources, &client_id).await;
    let refresh = tokens.refresh_token.clone().expect("refresh token");
    assert_eq!(resources.sessions.list_user_sessions("alice").await.unwrap().len(), 1);

    for _ in 0..2 {
        resources
            .oauth
            .revoke_token(&refresh, Some("refresh_token"))
            .await
            .expect("revoke refresh token");
    }

    assert!(!resources.oauth.introspect(&refresh, Some("refresh_token")).await.active);
    assert!(!resources.oauth.introspect(&tokens.access_token, None).await.active);
    assert!(
        resources
            .sessions
            .list_user_sessions("alice")
            .await
            .unwrap()
            .is_empty(),
        "linked session is revoked with its refresh token"
    );
    let reuse = resources.oauth.token(&refresh_grant(&client_id, &refresh)).await;
    assert!(matches!(reuse, Err(OAuthError::InvalidGrant(_))));

    // Access tokens revoke idempotently too.
    for _ in 0..2 {
        resources
            .oauth
            .revoke_token(&tokens.access_token, None)
            .await
            .expect("revoke access token");
    }
}

#[tokio::test]
async fn test_clients_only_see_their_own_tokens() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let owner = public_client(&resources).await;
    let other = public_client(&resources).await;
    let tokens = login(&resources, &owner.client.client_id).await;
    let refresh = tokens.refresh_token.clone().expect("refresh token");

    let foreign = resources
        .oauth
        .introspect_for_client(&other.client, &tokens.access_token, None)
        .await;
    assert!(!foreign.active);
    assert!(foreign.sub.is_none());

    resources
        .oauth
        .revoke_token_for_client(&other.client, &refresh, Some("refresh_token"))
        .await
        .expect("foreign revocation is accepted");
    assert!(
        resources
            .oauth
            .introspect_for_client(&owner.client, &refresh, Some("refresh_token"))
            .await
            .active,
        "another client cannot revoke the token"
    );
    assert_eq!(resources.sessions.list_user_sessions("alice").await.unwrap().len(), 1);

    resources
        .oauth
        .revoke_token_for_client(&owner.client, &tokens.access_token, None)
        .await
        .expect("owner revocation");
    assert!(
        !resources
            .oauth
            .introspect_for_client(&owner.client, &tokens.access_token, None)
            .await
            .active
    );
}

#[tokio::test]
async fn test_oauth_refresh_token_cannot_refresh_a_login_session() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let tokens = login(&resources, &client_id).await;
    let oauth_refresh = tokens.refresh_token.clone().expect("refresh token");

    let linked = resources.sessions.list_user_sessions("alice").await.unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].client_id.as_deref(), Some(client_id.as_str()));

    let crossed = resources.sessions.refresh(&oauth_refresh).await;
    assert!(matches!(crossed, Err(ServiceError::NotFound(_))));

    // The grant is untouched and still rotates at the token endpoint.
    let rotated = resources
        .oauth
        .token(&refresh_grant(&client_id, &oauth_refresh))
        .await
        .expect("refresh grant");
    let new_refresh = rotated.refresh_token.clone().expect("rotated refresh token");
    let after = resources.sessions.list_user_sessions("alice").await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, linked[0].id, "linked session follows the rotation");
    assert!(matches!(
        resources.sessions.refresh(&new_refresh).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_revoking_a_linked_session_revokes_its_grant() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let client = public_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let tokens = login(&resources, &client_id).await;
    let refresh = tokens.refresh_token.clone().expect("refresh token");

    let linked = resources.sessions.list_user_sessions("alice").await.unwrap();
    resources
        .sessions
        .revoke_session("alice", &linked[0].id)
        .await
        .expect("revoke session");

    assert!(!resources.oauth.introspect(&tokens.access_token, None).await.active);
    assert!(!resources.oauth.introspect(&refresh, Some("refresh_token")).await.active);
    let reuse = resources.oauth.token(&refresh_grant(&client_id, &refresh)).await;
    assert!(matches!(reuse, Err(OAuthError::InvalidGrant(_))));
}

#[tokio::test]
async fn test_client_secret_rotation_and_deactivation() {
    let resources = setup().await;
    let client = confidential_client(&resources).await;
    let client_id = client.client.client_id.clone();
    let old_secret = client.client_secret.clone().expect("confidential secret");

    let new_secret = resources
        .oauth
        .rotate_client_secret(&client_id)
        .await
        .expect("rotate secret");
    assert_ne!(new_secret, old_secret);
    let stale = resources
        .oauth
        .token(&client_credentials(&client_id, &old_secret))
        .await;
    assert!(matches!(stale, Err(OAuthError::InvalidClient(_))));
    resources
        .oauth
        .token(&client_credentials(&client_id, &new_secret))
        .await
        .expect("new secret works");

    let public = public_client(&resources).await;
    let no_secret = resources
        .oauth
        .rotate_client_secret(&public.client.client_id)
        .await;
    assert!(matches!(no_secret, Err(ServiceError::Validation(_))));
    assert_eq!(resources.oauth.list_clients(None).await.unwrap().len(), 2);

    resources
        .oauth
        .deactivate_client(&client_id)
        .await
        .expect("deactivate");
    let refused = resources
        .oauth
        .token(&client_credentials(&client_id, &new_secret))
        .await;
    assert!(matches!(refused, Err(OAuthError::InvalidClient(_))));
    assert!(!resources.oauth.get_client(&client.client.id).await.unwrap().is_active);

    let missing = resources.oauth.deactivate_client("no-such-client").await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));
}
