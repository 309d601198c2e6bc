use super::OAuthError;
use crate::entity::oauth2_client;

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";

/// Split a space-delimited scope string, dropping empties and duplicates.
pub fn parse_scopes(scope: Option<&str>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for s in scope.unwrap_or_default().split_whitespace() {
        if !scopes.iter().any(|existing| existing == s) {
            scopes.push(s.to_string());
        }
    }
    scopes
}

pub fn join_scopes(scopes: &[String]) -> String {
    scopes.join(" ")
}

/// Every requested scope must be in `allowed`.
pub fn validate_scopes(requested: &[String], allowed: &[String]) -> Result<(), OAuthError> {
    match requested.iter().find(|s| !allowed.contains(s)) {
        Some(scope) => Err(OAuthError::InvalidScope(format!(
            "scope '{scope}' is not allowed for this client"
        ))),
        None => Ok(()),
    }
}

/// The scopes a request ends up with: the requested set checked against the
/// client, or the client's defaults when nothing was asked for.
pub fn resolve_scopes(
    client: &oauth2_client::Model,
    requested: Option<&str>,
) -> Result<Vec<String>, OAuthError> {
    let requested = parse_scopes(requested);
    if requested.is_empty() {
        return Ok(client.default_scopes_list());
    }
    validate_scopes(&requested, &client.allowed_scopes_list())?;
    Ok(requested)
}
