use std::collections::{BTreeMap, HashMap};

use sea_orm::{EntityTrait, QueryOrder};
use serde::Serialize;
use utoipa::ToSchema;

use super::RbacEngine;
use crate::entity::{permission, role_permission};
use crate::error::ServiceError;

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct PermissionWithRoles {
    pub permission_id: String,
    pub name: String,
    pub action: String,
    pub description: Option<String>,
    /// Roles granting this permission
    pub roles: Vec<String>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ResourcePermissions {
    pub resource: String,
    pub permissions: Vec<PermissionWithRoles>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct PermissionMatrix {
    pub resources: Vec<ResourcePermissions>,
}

impl RbacEngine {
    /// Every permission grouped by resource, with the roles holding it.
    pub async fn get_permission_matrix(&self) -> Result<PermissionMatrix, ServiceError> {
        let permissions = permission::Entity::find()
            .order_by_asc(permission::Column::Resource)
            .order_by_asc(permission::Column::Action)
            .all(self.db.as_ref())
            .await?;
        let grants = role_permission::Entity::find()
            .order_by_asc(role_permission::Column::RoleId)
            .all(self.db.as_ref())
            .await?;

        let mut roles_by_permission: HashMap<String, Vec<String>> = HashMap::new();
        for grant in grants {
            roles_by_permission
                .entry(grant.permission_id)
                .or_default()
                .push(grant.role_id);
        }

        let mut by_resource: BTreeMap<String, Vec<PermissionWithRoles>> = BTreeMap::new();
        for perm in permissions {
            let roles = roles_by_permission.remove(&perm.id).unwrap_or_default();
            by_resource
                .entry(perm.resource)
                .or_default()
                .push(PermissionWithRoles {
                    permission_id: perm.id,
                    name: perm.name,
                    action: perm.action,
                    description: perm.description,
                    roles,
                });
        }

        Ok(PermissionMatrix {
            resources: by_resource
                .into_iter()
                .map(|(resource, permissions)| ResourcePermissions {
                    resource,
                    permissions,
                })
                .collect(),
        })
    }
}
