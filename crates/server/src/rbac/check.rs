use std::collections::BTreeSet;

use sea_orm::{
    ColumnTrait, EntityTrait, JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    RelationTrait, Select,
};

use super::{PermissionCheck, RbacEngine};
use crate::entity::{permission, role, role_permission, user_role};
use crate::error::ServiceError;

/// Permissions reachable from `user_id` through its roles.
fn user_permissions_query(user_id: &str) -> Select<permission::Entity> {
    permission::Entity::find()
        .join(JoinType::InnerJoin, permission::Relation::RolePermission.def())
        .join(JoinType::InnerJoin, role_permission::Relation::Role.def())
        .join(JoinType::InnerJoin, role::Relation::UserRole.def())
        .filter(user_role::Column::UserId.eq(user_id))
}

impl RbacEngine {
    #[tracing::instrument(skip(self))]
    pub async fn has_permission(&self, user_id: &str, name: &str) -> Result<bool, ServiceError> {
        let count = user_permissions_query(user_id)
            .filter(permission::Column::Name.eq(name))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    #[tracing::instrument(skip(self))]
    pub async fn has_any_permission(
        &self,
        user_id: &str,
        names: &[String],
    ) -> Result<bool, ServiceError> {
        if names.is_empty() {
            return Ok(false);
        }
        let count = user_permissions_query(user_id)
            .filter(permission::Column::Name.is_in(names.iter().cloned()))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    /// True iff the union of the user's role permissions contains every name.
    #[tracing::instrument(skip(self))]
    pub async fn has_all_permissions(
        &self,
        user_id: &str,
        names: &[String],
    ) -> Result<bool, ServiceError> {
        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        if wanted.is_empty() {
            return Ok(true);
        }
        let held: Vec<String> = user_permissions_query(user_id)
            .select_only()
            .column(permission::Column::Name)
            .distinct()
            .filter(permission::Column::Name.is_in(wanted.iter().copied()))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        let held: BTreeSet<&str> = held.iter().map(String::as_str).collect();
        Ok(wanted.is_subset(&held))
    }

    pub async fn get_user_permissions(
        &self,
        user_id: &str,
    ) -> Result<Vec<permission::Model>, ServiceError> {
        Ok(user_permissions_query(user_id)
            .distinct()
            .order_by_asc(permission::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn get_user_roles(&self, user_id: &str) -> Result<Vec<role::Model>, ServiceError> {
        Ok(role::Entity::find()
            .join(JoinType::InnerJoin, role::Relation::UserRole.def())
            .filter(user_role::Column::UserId.eq(user_id))
            .order_by_asc(role::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn get_user_role_names(&self, user_id: &str) -> Result<Vec<String>, ServiceError> {
        Ok(self
            .get_user_roles(user_id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    /// Ids of users holding `role_id`.
    pub async fn users_with_role(&self, role_id: &str) -> Result<Vec<String>, ServiceError> {
        Ok(user_role::Entity::find()
            .select_only()
            .column(user_role::Column::UserId)
            .filter(user_role::Column::RoleId.eq(role_id))
            .order_by_asc(user_role::Column::UserId)
            .into_tuple()
            .all(self.db.as_ref())
            .await?)
    }

    /// Resource/action check reporting which role grants it.
    #[tracing::instrument(skip(self))]
    pub async fn check_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<PermissionCheck, ServiceError> {
        let granting: Option<String> = role::Entity::find()
            .select_only()
            .column(role::Column::Name)
            .join(JoinType::InnerJoin, role::Relation::UserRole.def())
            .join(JoinType::InnerJoin, role::Relation::RolePermission.def())
            .join(JoinType::InnerJoin, role_permission::Relation::Permission.def())
            .filter(user_role::Column::UserId.eq(user_id))
            .filter(permission::Column::Resource.eq(resource))
            .filter(permission::Column::Action.eq(action))
            .order_by_asc(role::Column::Name)
            .into_tuple()
            .one(self.db.as_ref())
            .await?;

        Ok(PermissionCheck {
            allowed: granting.is_some(),
            role: granting,
        })
    }
}
