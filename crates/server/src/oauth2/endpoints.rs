//! OAuth2 HTTP endpoints.
//!
//! Thin wrappers around [`OAuthServer`](super::OAuthServer): parse the
//! request, authenticate the caller, render the RFC error body.

use crate::AppResources;
use crate::api::auth::{ApiError, SessionAuth, bearer_token};
use crate::oauth2::{
    AuthorizeRequest, ConsentSummary, DeviceAuthorization, DiscoveryDocument,
    IntrospectionResponse, OAUTH2_TAG, OAuthError, TokenRequest, TokenResponse, UserInfo, scope,
};
use crate::rate_limit;
use axum::{
    Extension, Form, Json,
    extract::{Path, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Routes mounted under `/oauth2`.
pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(token))
        .routes(routes!(introspect))
        .routes(routes!(revoke))
        .routes(routes!(consent))
        .routes(routes!(list_consents))
        .routes(routes!(revoke_consent))
        .routes(routes!(device_code))
        .routes(routes!(device_approve))
        .routes(routes!(userinfo))
}

/// Routes mounted under `/.well-known`.
pub fn well_known_router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(openid_configuration))
        .routes(routes!(jwks))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IntrospectRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// The user's answer on the consent screen, echoing the authorize request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentDecision {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub approve: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsentOutcome {
    /// Where the user agent should go next
    pub redirect_to: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeviceCodeRequest {
    pub client_id: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeviceApproval {
    pub user_code: String,
    pub approve: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
}

// =============================================================================
// Endpoints
// =============================================================================

/// OAuth2 Authorization endpoint.
///
/// The user is identified by a first-party session access token. Without one
/// the caller gets `login_required` and is expected to log the user in first.
#[tracing::instrument(skip(resources, headers, params), fields(client_id = %params.client_id))]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Issue an authorization code",
    description = "Starts the Authorization Code flow for the user holding the bearer session token. \
                   On success the user agent is redirected to `redirect_uri` with `code` and `state`.\n\n\
                   **PKCE:** required for public clients and clients registered with `require_pkce`. \
                   `S256` is the only method accepted unless plain PKCE is enabled.\n\n\
                   When the client needs consent that the user has not given, the redirect carries \
                   `error=consent_required`; record the decision with `POST /oauth2/consent`.",
    params(
        ("response_type" = String, Query, description = "Must be `code`."),
        ("client_id" = String, Query, description = "The client identifier issued during client registration."),
        ("redirect_uri" = String, Query, description = "Must exactly match a registered redirect URI."),
        ("scope" = Option<String>, Query, description = "Space-separated list of requested scopes. Defaults to the client's default scopes."),
        ("state" = Option<String>, Query, description = "Opaque value returned unchanged in the redirect."),
        ("nonce" = Option<String>, Query, description = "Included in the ID token if provided."),
        ("code_challenge" = Option<String>, Query, description = "PKCE code challenge."),
        ("code_challenge_method" = Option<String>, Query, description = "PKCE challenge method, `S256` or `plain`."),
    ),
    responses(
        (status = 303, description = "Redirect back to the client with a code or an error"),
        (status = 400, description = "Unknown client or unregistered redirect URI", body = ErrorResponse),
        (status = 401, description = "No valid session (`login_required`)", body = ErrorResponse),
    )
)]
pub async fn authorize(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeRequest>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let user_id = match bearer_token(&headers) {
        Some(token) => match resources.sessions.validate_access_token(token).await {
            Ok(claims) => claims.sub,
            Err(_) => return oauth_error(OAuthError::LoginRequired, expose),
        },
        None => return oauth_error(OAuthError::LoginRequired, expose),
    };

    let redirect_uri = params.redirect_uri.clone();
    let state = params.state.clone();
    match resources.oauth.authorize(&user_id, params).await {
        Ok(grant) => match grant.redirect_url() {
            Ok(url) => Redirect::to(&url).into_response(),
            Err(e) => oauth_error(e.into(), expose),
        },
        // Never redirect to an unverified client or URI.
        Err(e @ (OAuthError::InvalidClient(_)
        | OAuthError::InvalidRequest(_)
        | OAuthError::ServerError(_))) => oauth_error(e, expose),
        Err(e) => error_redirect(redirect_uri.as_deref(), state.as_deref(), &e, expose),
    }
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip_all, fields(grant_type = %params.grant_type))]
#[utoipa::path(
    post,
    path = "/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange a grant for tokens",
    description = "Supports `authorization_code`, `refresh_token`, `client_credentials` and \
                   `urn:ietf:params:oauth:grant-type:device_code`.\n\n\
                   **Client authentication:** HTTP Basic or `client_id`/`client_secret` in the body. \
                   Public clients send only `client_id`.\n\n\
                   Refresh tokens rotate: the presented refresh token stops working once a new pair is issued.",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse),
    )
)]
pub async fn token(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Form(mut params): Form<TokenRequest>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let (client_id, client_secret) =
        extract_client_credentials(&headers, params.client_id.take(), params.client_secret.take());
    params.client_id = client_id;
    params.client_secret = client_secret;

    let key = format!("token:{}", params.client_id.as_deref().unwrap_or("anonymous"));
    if !rate_limit::allow(
        resources.rate_limiter.as_ref(),
        &resources.config.rate_limit,
        &key,
    )
    .await
    {
        return oauth_error(OAuthError::RateLimited, expose);
    }

    match resources.oauth.token(&params).await {
        Ok(tokens) => no_store(Json(tokens)),
        Err(e) => oauth_error(e, expose),
    }
}

/// OAuth2 Token Introspection (RFC 7662).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/introspect",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Introspect",
    summary = "Describe a token",
    description = "Returns `active: true` with token metadata when the token was issued to the calling client \
                   and is unexpired, unrevoked and not blacklisted, and `active: false` otherwise. \
                   Requires client authentication.",
    request_body(content = IntrospectRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Introspection result", body = IntrospectionResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn introspect(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Form(params): Form<IntrospectRequest>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let (client_id, client_secret) =
        extract_client_credentials(&headers, params.client_id, params.client_secret);
    let client = match resources
        .oauth
        .authenticate_client(client_id.as_deref(), client_secret.as_deref())
        .await
    {
        Ok(client) => client,
        Err(e) => return oauth_error(e, expose),
    };
    let result = resources
        .oauth
        .introspect_for_client(&client, &params.token, params.token_type_hint.as_deref())
        .await;
    no_store(Json(result))
}

/// OAuth2 Token Revocation (RFC 7009).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/revoke",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke",
    summary = "Revoke a token",
    description = "Revokes an access or refresh token. Revoking a refresh token also revokes the access token \
                   issued with it and the session linked to it. Unknown tokens and tokens issued to other clients \
                   are accepted silently.",
    request_body(content = RevokeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked (or was never valid)"),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn revoke(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Form(params): Form<RevokeRequest>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let (client_id, client_secret) =
        extract_client_credentials(&headers, params.client_id, params.client_secret);
    let client = match resources
        .oauth
        .authenticate_client(client_id.as_deref(), client_secret.as_deref())
        .await
    {
        Ok(client) => client,
        Err(e) => return oauth_error(e, expose),
    };
    match resources
        .oauth
        .revoke_token_for_client(&client, &params.token, params.token_type_hint.as_deref())
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => oauth_error(e.into(), expose),
    }
}

/// Record the user's consent decision.
#[tracing::instrument(skip_all, fields(client_id = %decision.client_id, approve = decision.approve))]
#[utoipa::path(
    post,
    path = "/consent",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Consent",
    summary = "Approve or deny a client",
    description = "Approving stores the consent and immediately issues an authorization code; denying \
                   sends `access_denied` back to the client. Either way the response says where to send the user agent.",
    request_body = ConsentDecision,
    responses(
        (status = 200, description = "Decision recorded", body = ConsentOutcome),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session token", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn consent(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
    Json(decision): Json<ConsentDecision>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let oauth = &resources.oauth;

    if !decision.approve {
        if let Err(e) = oauth
            .validate_redirect(&decision.client_id, &decision.redirect_uri)
            .await
        {
            return oauth_error(e, expose);
        }
        let denied = OAuthError::AccessDenied("the user denied the request".into());
        return match error_redirect_url(&decision.redirect_uri, decision.state.as_deref(), &denied, expose) {
            Some(redirect_to) => Json(ConsentOutcome { redirect_to }).into_response(),
            None => oauth_error(denied, expose),
        };
    }

    let requested = scope::parse_scopes(decision.scope.as_deref());
    let scopes = if requested.is_empty() {
        match oauth.get_client_by_client_id(&decision.client_id).await {
            Ok(client) => client.default_scopes_list(),
            Err(e) => return oauth_error(e.into(), expose),
        }
    } else {
        requested
    };
    if let Err(e) = oauth
        .grant_consent(&claims.sub, &decision.client_id, &scopes)
        .await
    {
        return oauth_error(e, expose);
    }

    let request = AuthorizeRequest {
        response_type: "code".to_string(),
        client_id: decision.client_id,
        redirect_uri: Some(decision.redirect_uri),
        scope: Some(scope::join_scopes(&scopes)),
        state: decision.state,
        nonce: decision.nonce,
        code_challenge: decision.code_challenge,
        code_challenge_method: decision.code_challenge_method,
    };
    match oauth.authorize(&claims.sub, request).await {
        Ok(grant) => match grant.redirect_url() {
            Ok(redirect_to) => Json(ConsentOutcome { redirect_to }).into_response(),
            Err(e) => oauth_error(e.into(), expose),
        },
        Err(e) => oauth_error(e, expose),
    }
}

/// Clients the current user has consented to.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/consents",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 List Consents",
    summary = "List granted consents",
    responses(
        (status = 200, description = "Live consents, most recent first", body = [ConsentSummary]),
        (status = 401, description = "Missing or invalid session token", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn list_consents(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
) -> Result<Json<Vec<ConsentSummary>>, ApiError> {
    resources
        .oauth
        .list_user_consents(&claims.sub)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

/// Withdraw consent from a client, revoking its tokens for this user.
#[tracing::instrument(skip(resources, claims))]
#[utoipa::path(
    delete,
    path = "/consents/{client_id}",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke Consent",
    summary = "Revoke a consent",
    params(("client_id" = String, Path, description = "Public client identifier")),
    responses(
        (status = 204, description = "Consent revoked"),
        (status = 401, description = "Missing or invalid session token", body = ApiError),
        (status = 404, description = "No consent for this client", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn revoke_consent(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
    Path(client_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    resources
        .oauth
        .revoke_consent(&claims.sub, &client_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))
}

/// Device Authorization endpoint (RFC 8628).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/device/code",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Device Authorization",
    summary = "Start a device flow",
    request_body(content = DeviceCodeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Device and user codes", body = DeviceAuthorization),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unknown client", body = ErrorResponse),
    )
)]
pub async fn device_code(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Form(params): Form<DeviceCodeRequest>,
) -> Response {
    let expose = resources.config.expose_error_details;
    let (client_id, _) = extract_client_credentials(&headers, params.client_id, None);
    let Some(client_id) = client_id else {
        return oauth_error(OAuthError::InvalidClient("client_id is required".into()), expose);
    };
    match resources
        .oauth
        .device_authorization(&client_id, params.scope.as_deref())
        .await
    {
        Ok(authorization) => no_store(Json(authorization)),
        Err(e) => oauth_error(e, expose),
    }
}

/// Approve or deny a device by its user code.
#[tracing::instrument(skip_all, fields(approve = approval.approve))]
#[utoipa::path(
    post,
    path = "/device/approve",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Device Approve",
    summary = "Decide a pending device code",
    request_body = DeviceApproval,
    responses(
        (status = 200, description = "Decision recorded", body = StatusResponse),
        (status = 400, description = "Code expired", body = ApiError),
        (status = 404, description = "Unknown user code", body = ApiError),
        (status = 409, description = "Code already decided", body = ApiError),
    ),
    security(("Authorization" = []))
)]
pub async fn device_approve(
    Extension(resources): Extension<AppResources>,
    SessionAuth(claims): SessionAuth,
    Json(approval): Json<DeviceApproval>,
) -> Result<Json<StatusResponse>, ApiError> {
    resources
        .oauth
        .approve_device_code(&claims.sub, &approval.user_code, approval.approve)
        .await
        .map_err(|e| ApiError::from_service(e, resources.config.expose_error_details))?;
    Ok(Json(StatusResponse {
        status: if approval.approve { "approved" } else { "denied" }.to_string(),
    }))
}

/// OpenID Connect UserInfo endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 UserInfo",
    summary = "Claims about the token's user",
    description = "Requires an OAuth access token. `email` and `email_verified` need the `email` scope; \
                   `name`, `preferred_username` and `updated_at` need `profile`.",
    responses(
        (status = 200, description = "User claims", body = UserInfo),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse),
    ),
    security(("OAuth2" = ["openid"]))
)]
pub async fn userinfo(Extension(resources): Extension<AppResources>, headers: HeaderMap) -> Response {
    let expose = resources.config.expose_error_details;
    let Some(token) = bearer_token(&headers) else {
        return oauth_error(
            OAuthError::InvalidToken("missing bearer token".into()),
            expose,
        );
    };
    match resources.oauth.userinfo(token).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => oauth_error(e, expose),
    }
}

/// OpenID Connect Discovery document.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Configuration",
    summary = "OpenID Connect discovery",
    responses((status = 200, description = "Discovery document", body = DiscoveryDocument))
)]
pub async fn openid_configuration(
    Extension(resources): Extension<AppResources>,
) -> Json<DiscoveryDocument> {
    Json(resources.oauth.discovery_document())
}

/// JSON Web Key Set.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/jwks.json",
    tag = OAUTH2_TAG,
    operation_id = "JWKS",
    summary = "Public signing keys",
    responses((status = 200, description = "JWK set", body = Object))
)]
pub async fn jwks(Extension(resources): Extension<AppResources>) -> Json<serde_json::Value> {
    Json(resources.oauth.jwks())
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Client credentials from HTTP Basic, falling back to the form body.
fn extract_client_credentials(
    headers: &HeaderMap,
    form_id: Option<String>,
    form_secret: Option<String>,
) -> (Option<String>, Option<String>) {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        && let Ok(decoded) =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, auth.trim())
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        let secret = (!secret.is_empty()).then(|| secret.to_string());
        return (Some(id.to_string()), secret);
    }

    (form_id.filter(|id| !id.is_empty()), form_secret.filter(|s| !s.is_empty()))
}

fn no_store(body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// JSON error body with the status the error calls for.
fn oauth_error(err: OAuthError, expose: bool) -> Response {
    if let OAuthError::ServerError(inner) = &err {
        tracing::error!(error = ?inner, "OAuth request failed");
    }
    let status = err.status();
    let body = ErrorResponse {
        error: err.code().to_string(),
        error_description: err.description(expose),
    };
    let mut response = (status, Json(body)).into_response();
    match &err {
        OAuthError::InvalidClient(_) => {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"oauth2\""),
            );
        }
        OAuthError::InvalidToken(_) => {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        _ => {}
    }
    response
}

fn error_redirect_url(
    redirect_uri: &str,
    state: Option<&str>,
    err: &OAuthError,
    expose: bool,
) -> Option<String> {
    let mut redirect_url = url::Url::parse(redirect_uri).ok()?;
    redirect_url
        .query_pairs_mut()
        .append_pair("error", err.code());
    if let Some(desc) = err.description(expose) {
        redirect_url
            .query_pairs_mut()
            .append_pair("error_description", &desc);
    }
    if let Some(s) = state {
        redirect_url.query_pairs_mut().append_pair("state", s);
    }
    Some(redirect_url.into())
}

fn error_redirect(
    redirect_uri: Option<&str>,
    state: Option<&str>,
    err: &OAuthError,
    expose: bool,
) -> Response {
    match redirect_uri.and_then(|uri| error_redirect_url(uri, state, err, expose)) {
        Some(url) => Redirect::to(&url).into_response(),
        None => {
            let body = ErrorResponse {
                error: err.code().to_string(),
                error_description: err.description(expose),
            };
            (err.status(), Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn basic_auth_wins_over_form_credentials() {
        let mut headers = HeaderMap::new();
        // base64("agw_id:agws_secret")
        headers.insert(
            "authorization",
            HeaderValue::from_static("Basic YWd3X2lkOmFnd3Nfc2VjcmV0"),
        );
        let (id, secret) =
            extract_client_credentials(&headers, Some("form".into()), Some("form-secret".into()));
        assert_eq!(id.as_deref(), Some("agw_id"));
        assert_eq!(secret.as_deref(), Some("agws_secret"));
    }

    #[test]
    fn form_credentials_are_the_fallback() {
        let (id, secret) =
            extract_client_credentials(&HeaderMap::new(), Some("agw_id".into()), Some(String::new()));
        assert_eq!(id.as_deref(), Some("agw_id"));
        assert_eq!(secret, None);
    }

    #[test]
    fn error_redirect_keeps_existing_query() {
        let url = error_redirect_url(
            "https://app.example.com/cb?x=1",
            Some("s1"),
            &OAuthError::ConsentRequired,
            false,
        )
        .unwrap();
        assert_eq!(url, "https://app.example.com/cb?x=1&error=consent_required&state=s1");
    }

    #[test]
    fn invalid_client_sets_www_authenticate() {
        let response = oauth_error(OAuthError::InvalidClient("x".into()), false);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
