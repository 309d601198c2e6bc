//! Role-based access control.
//!
//! Permissions are granted to roles and roles to users. Every check resolves
//! through `permission <- role_permission <- role <- user_role`.

mod check;
mod matrix;
mod roles;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use matrix::{PermissionMatrix, PermissionWithRoles, ResourcePermissions};

use crate::consistency::Coordinator;

#[derive(Clone)]
pub struct RbacEngine {
    db: Arc<DatabaseConnection>,
    coordinator: Coordinator,
    admin_role_name: String,
}

impl RbacEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        coordinator: Coordinator,
        admin_role_name: impl Into<String>,
    ) -> Self {
        Self {
            db,
            coordinator,
            admin_role_name: admin_role_name.into(),
        }
    }

    pub fn admin_role_name(&self) -> &str {
        &self.admin_role_name
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatePermission {
    pub name: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateRole {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Permission ids granted at creation
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateRole {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Replaces the role's permission set when present
    pub permissions: Option<Vec<String>>,
}

/// Outcome of a resource/action check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct PermissionCheck {
    pub allowed: bool,
    /// Name of a role that grants the permission
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}
