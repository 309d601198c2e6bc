//! Database entities.

pub mod oauth2_access_token;
pub mod oauth2_authorization;
pub mod oauth2_client;
pub mod oauth2_consent;
pub mod oauth2_device_code;
pub mod oauth2_refresh_token;
pub mod permission;
pub mod role;
pub mod role_permission;
pub mod session;
pub mod token_blacklist;
pub mod user;
pub mod user_role;
