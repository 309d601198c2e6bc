//! Session lifecycle: login, rotation, logout, revocation.

mod common;

use auth_gateway::error::ServiceError;
use auth_gateway::session::SessionMetadata;
use common::{deactivate_user, grant_role, insert_user, setup};

fn laptop() -> SessionMetadata {
    SessionMetadata {
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: Some("test-agent/1.0".to_string()),
        session_name: Some("laptop".to_string()),
    }
}

#[tokio::test]
async fn test_create_session_issues_verifiable_pair() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    grant_role(&resources, "alice", "editor", &[("documents", "write")]).await;

    let tokens = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("create session");
    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.expires_in, resources.config.session.access_token_ttl_secs);

    let claims = resources
        .sessions
        .validate_access_token(&tokens.access_token)
        .await
        .expect("valid access token");
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.sid, tokens.session_id);
    assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    assert_eq!(claims.roles, vec!["editor".to_string()]);

    let sessions = resources
        .sessions
        .list_user_sessions("alice")
        .await
        .expect("list sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, tokens.session_id);
    assert_eq!(sessions[0].session_name.as_deref(), Some("laptop"));
}

#[tokio::test]
async fn test_inactive_user_cannot_log_in() {
    let resources = setup().await;
    insert_user(&resources.db, "bob", "bob@example.com").await;
    deactivate_user(&resources.db, "bob").await;

    let result = resources
        .sessions
        .create_session("bob", SessionMetadata::default())
        .await;
    assert!(matches!(result, Err(ServiceError::Forbidden(_))));
}

#[tokio::test]
async fn test_refresh_rotates_and_replay_fails() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let first = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("create session");

    let second = resources
        .sessions
        .refresh(&first.refresh_token)
        .await
        .expect("refresh");
    assert_eq!(second.session_id, first.session_id);
    assert_ne!(second.refresh_token, first.refresh_token);
    assert_ne!(second.access_token, first.access_token);

    let replay = resources.sessions.refresh(&first.refresh_token).await;
    assert!(matches!(replay, Err(ServiceError::NotFound(_))));

    // The access token issued before the rotation is retired with it.
    let stale = resources
        .sessions
        .validate_access_token(&first.access_token)
        .await;
    assert!(matches!(stale, Err(ServiceError::Revoked)));
    resources
        .sessions
        .validate_access_token(&second.access_token)
        .await
        .expect("rotated access token is valid");

    resources
        .sessions
        .refresh(&second.refresh_token)
        .await
        .expect("rotated token works");
}

#[tokio::test]
async fn test_concurrent_refresh_has_one_winner() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let tokens = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("create session");

    let (a, b) = tokio::join!(
        resources.sessions.refresh(&tokens.refresh_token),
        resources.sessions.refresh(&tokens.refresh_token),
    );
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1, "exactly one rotation may win");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_logout_blacklists_and_is_idempotent() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let tokens = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("create session");

    resources
        .sessions
        .logout(&tokens.access_token)
        .await
        .expect("logout");

    let check = resources
        .sessions
        .validate_access_token(&tokens.access_token)
        .await;
    assert!(matches!(check, Err(ServiceError::Revoked)));

    let refresh = resources.sessions.refresh(&tokens.refresh_token).await;
    assert!(matches!(refresh, Err(ServiceError::NotFound(_))));

    resources
        .sessions
        .logout(&tokens.access_token)
        .await
        .expect("second logout succeeds");

    assert!(
        resources
            .sessions
            .list_user_sessions("alice")
            .await
            .expect("list")
            .is_empty()
    );
}

#[tokio::test]
async fn test_logout_rejects_garbage() {
    let resources = setup().await;
    let result = resources.sessions.logout("not-a-jwt").await;
    assert!(matches!(result, Err(ServiceError::InvalidOrExpiredToken)));
}

#[tokio::test]
async fn test_revoke_session_checks_ownership() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    insert_user(&resources.db, "mallory", "mallory@example.com").await;
    let tokens = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("create session");

    let foreign = resources
        .sessions
        .revoke_session("mallory", &tokens.session_id)
        .await;
    assert!(matches!(foreign, Err(ServiceError::Forbidden(_))));

    let unknown = resources.sessions.revoke_session("alice", "no-such-session").await;
    assert!(matches!(unknown, Err(ServiceError::NotFound(_))));

    resources
        .sessions
        .revoke_session("alice", &tokens.session_id)
        .await
        .expect("revoke");
    resources
        .sessions
        .revoke_session("alice", &tokens.session_id)
        .await
        .expect("revoking twice succeeds");

    let check = resources
        .sessions
        .validate_access_token(&tokens.access_token)
        .await;
    assert!(matches!(check, Err(ServiceError::Revoked)));
}

#[tokio::test]
async fn test_revoke_other_sessions_keeps_current() {
    let resources = setup().await;
    insert_user(&resources.db, "alice", "alice@example.com").await;
    let current = resources
        .sessions
        .create_session("alice", laptop())
        .await
        .expect("session 1");
    let phone = resources
        .sessions
        .create_session("alice", SessionMetadata::default())
        .await
        .expect("session 2");
    let tablet = resources
        .sessions
        .create_session("alice", SessionMetadata::default())
        .await
        .expect("session 3");

    let revoked = resources
        .sessions
        .revoke_all_user_sessions("alice", Some(&current.session_id))
        .await
        .expect("revoke others");
    assert_eq!(revoked, 2);

    for other in [&phone, &tablet] {
        let check = resources
            .sessions
            .validate_access_token(&other.access_token)
            .await;
        assert!(matches!(check, Err(ServiceError::Revoked)));
    }
    resources
        .sessions
        .validate_access_token(&current.access_token)
        .await
        .expect("current session survives");

    let again = resources
        .sessions
        .revoke_all_user_sessions("alice", Some(&current.session_id))
        .await
        .expect("revoke others again");
    assert_eq!(again, 0);
}
