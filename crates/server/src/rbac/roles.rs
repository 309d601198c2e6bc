use std::collections::BTreeSet;

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use time::OffsetDateTime;

use super::{CreatePermission, CreateRole, RbacEngine, UpdateRole};
use crate::entity::{permission, role, role_permission, user, user_role};
use crate::error::ServiceError;

fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn require(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Fetch a role and hold a row lock on it for the rest of the transaction.
async fn lock_role<C: ConnectionTrait>(conn: &C, role_id: &str) -> Result<role::Model, ServiceError> {
    role::Entity::find_by_id(role_id.to_string())
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("role {role_id}")))
}

async fn replace_role_permissions<C: ConnectionTrait>(
    conn: &C,
    role_id: &str,
    permission_ids: &[String],
) -> Result<(), ServiceError> {
    if !permission_ids.is_empty() {
        let found = permission::Entity::find()
            .filter(permission::Column::Id.is_in(permission_ids.iter().cloned()))
            .count(conn)
            .await?;
        if found != permission_ids.len() as u64 {
            return Err(ServiceError::Validation("unknown permission id".into()));
        }
    }

    role_permission::Entity::delete_many()
        .filter(role_permission::Column::RoleId.eq(role_id))
        .exec(conn)
        .await?;

    if permission_ids.is_empty() {
        return Ok(());
    }
    let now = OffsetDateTime::now_utc();
    let rows = permission_ids
        .iter()
        .map(|permission_id| role_permission::ActiveModel {
            role_id: Set(role_id.to_string()),
            permission_id: Set(permission_id.clone()),
            granted_at: Set(now),
        });
    role_permission::Entity::insert_many(rows)
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

/// Reject changes that would leave the admin role without holders.
async fn guard_last_admin<C: ConnectionTrait>(
    conn: &C,
    admin_role_id: &str,
    user_id: &str,
) -> Result<(), ServiceError> {
    let holds = user_role::Entity::find_by_id((user_id.to_string(), admin_role_id.to_string()))
        .one(conn)
        .await?
        .is_some();
    if !holds {
        return Ok(());
    }
    let holders = user_role::Entity::find()
        .filter(user_role::Column::RoleId.eq(admin_role_id))
        .count(conn)
        .await?;
    if holders <= 1 {
        return Err(ServiceError::Forbidden(
            "cannot remove the last administrator".into(),
        ));
    }
    Ok(())
}

impl RbacEngine {
    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_permission(
        &self,
        req: CreatePermission,
    ) -> Result<permission::Model, ServiceError> {
        require("name", &req.name)?;
        require("resource", &req.resource)?;
        require("action", &req.action)?;

        if self.get_permission_by_name(&req.name).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "permission {} already exists",
                req.name
            )));
        }

        let model = permission::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            name: Set(req.name),
            resource: Set(req.resource),
            action: Set(req.action),
            description: Set(req.description),
            created_at: Set(OffsetDateTime::now_utc()),
        };
        Ok(model.insert(self.db.as_ref()).await?)
    }

    pub async fn get_permission(&self, id: &str) -> Result<permission::Model, ServiceError> {
        permission::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("permission {id}")))
    }

    pub async fn get_permission_by_name(
        &self,
        name: &str,
    ) -> Result<Option<permission::Model>, ServiceError> {
        Ok(permission::Entity::find()
            .filter(permission::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn list_permissions(&self) -> Result<Vec<permission::Model>, ServiceError> {
        Ok(permission::Entity::find()
            .order_by_asc(permission::Column::Resource)
            .order_by_asc(permission::Column::Action)
            .all(self.db.as_ref())
            .await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_permission(&self, id: &str) -> Result<(), ServiceError> {
        self.coordinator
            .in_transaction(self.db.as_ref(), "delete_permission", |txn| {
                let id = id.to_string();
                Box::pin(async move {
                    role_permission::Entity::delete_many()
                        .filter(role_permission::Column::PermissionId.eq(id.as_str()))
                        .exec(txn)
                        .await?;
                    let result = permission::Entity::delete_by_id(id.clone())
                        .exec(txn)
                        .await?;
                    if result.rows_affected == 0 {
                        return Err(ServiceError::NotFound(format!("permission {id}")));
                    }
                    Ok(())
                })
            })
            .await
    }

    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_role(&self, req: CreateRole) -> Result<role::Model, ServiceError> {
        require("name", &req.name)?;
        require("display_name", &req.display_name)?;
        let permission_ids = dedupe(&req.permissions);

        self.coordinator
            .in_transaction(self.db.as_ref(), "create_role", |txn| {
                let req = req.clone();
                let permission_ids = permission_ids.clone();
                Box::pin(async move {
                    let existing = role::Entity::find()
                        .filter(role::Column::Name.eq(req.name.as_str()))
                        .one(txn)
                        .await?;
                    if existing.is_some() {
                        return Err(ServiceError::Conflict(format!(
                            "role {} already exists",
                            req.name
                        )));
                    }

                    let now = OffsetDateTime::now_utc();
                    let created = role::ActiveModel {
                        id: Set(uuid::Uuid::new_v4().to_string()),
                        name: Set(req.name),
                        display_name: Set(req.display_name),
                        description: Set(req.description),
                        is_system_role: Set(false),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(txn)
                    .await?;

                    replace_role_permissions(txn, &created.id, &permission_ids).await?;
                    Ok(created)
                })
            })
            .await
    }

    pub async fn get_role(&self, id: &str) -> Result<role::Model, ServiceError> {
        role::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("role {id}")))
    }

    pub async fn get_role_by_name(&self, name: &str) -> Result<role::Model, ServiceError> {
        role::Entity::find()
            .filter(role::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("role {name}")))
    }

    pub async fn list_roles(&self) -> Result<Vec<role::Model>, ServiceError> {
        Ok(role::Entity::find()
            .order_by_asc(role::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn get_role_permissions(
        &self,
        role_id: &str,
    ) -> Result<Vec<permission::Model>, ServiceError> {
        let role = self.get_role(role_id).await?;
        Ok(permission::Entity::find()
            .inner_join(role_permission::Entity)
            .filter(role_permission::Column::RoleId.eq(role.id))
            .order_by_asc(permission::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    /// Update a role's metadata and, when given, replace its permission set.
    /// System roles keep their name.
    #[tracing::instrument(skip(self, req))]
    pub async fn update_role(&self, id: &str, req: UpdateRole) -> Result<role::Model, ServiceError> {
        if let Some(name) = &req.name {
            require("name", name)?;
        }
        let permission_ids = req.permissions.as_deref().map(dedupe);

        self.coordinator
            .in_transaction(self.db.as_ref(), "update_role", |txn| {
                let id = id.to_string();
                let req = req.clone();
                let permission_ids = permission_ids.clone();
                Box::pin(async move {
                    let current = lock_role(txn, &id).await?;
                    let mut active: role::ActiveModel = current.clone().into();

                    if let Some(name) = req.name.filter(|n| *n != current.name) {
                        if current.is_system_role {
                            return Err(ServiceError::Forbidden(
                                "system roles cannot be renamed".into(),
                            ));
                        }
                        let taken = role::Entity::find()
                            .filter(role::Column::Name.eq(name.as_str()))
                            .one(txn)
                            .await?;
                        if taken.is_some() {
                            return Err(ServiceError::Conflict(format!(
                                "role {name} already exists"
                            )));
                        }
                        active.name = Set(name);
                    }
                    if let Some(display_name) = req.display_name {
                        active.display_name = Set(display_name);
                    }
                    if let Some(description) = req.description {
                        active.description = Set(Some(description));
                    }
                    active.updated_at = Set(OffsetDateTime::now_utc());
                    let updated = active.update(txn).await?;

                    if let Some(ids) = permission_ids {
                        replace_role_permissions(txn, &id, &ids).await?;
                    }
                    Ok(updated)
                })
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_role(&self, id: &str) -> Result<(), ServiceError> {
        self.coordinator
            .in_transaction(self.db.as_ref(), "delete_role", |txn| {
                let id = id.to_string();
                Box::pin(async move {
                    let current = lock_role(txn, &id).await?;
                    if current.is_system_role {
                        return Err(ServiceError::Forbidden(
                            "system roles cannot be deleted".into(),
                        ));
                    }
                    role_permission::Entity::delete_many()
                        .filter(role_permission::Column::RoleId.eq(id.as_str()))
                        .exec(txn)
                        .await?;
                    user_role::Entity::delete_many()
                        .filter(user_role::Column::RoleId.eq(id.as_str()))
                        .exec(txn)
                        .await?;
                    let result = role::Entity::delete_many()
                        .filter(role::Column::Id.eq(id.as_str()))
                        .filter(role::Column::IsSystemRole.eq(false))
                        .exec(txn)
                        .await?;
                    if result.rows_affected == 0 {
                        return Err(ServiceError::NotFound(format!("role {id}")));
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Replace the role's whole permission set.
    #[tracing::instrument(skip(self, permission_ids), fields(count = permission_ids.len()))]
    pub async fn set_role_permissions(
        &self,
        role_id: &str,
        permission_ids: &[String],
    ) -> Result<(), ServiceError> {
        let permission_ids = dedupe(permission_ids);
        self.coordinator
            .in_transaction(self.db.as_ref(), "set_role_permissions", |txn| {
                let role_id = role_id.to_string();
                let permission_ids = permission_ids.clone();
                Box::pin(async move {
                    lock_role(txn, &role_id).await?;
                    replace_role_permissions(txn, &role_id, &permission_ids).await
                })
            })
            .await
    }

    /// Idempotent: assigning a held role is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn assign_role_to_user(
        &self,
        user_id: &str,
        role_id: &str,
        assigned_by: Option<&str>,
    ) -> Result<(), ServiceError> {
        require("user_id", user_id)?;
        self.get_role(role_id).await?;

        let row = user_role::ActiveModel {
            user_id: Set(user_id.to_string()),
            role_id: Set(role_id.to_string()),
            assigned_at: Set(OffsetDateTime::now_utc()),
            assigned_by: Set(assigned_by.map(String::from)),
        };
        user_role::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([user_role::Column::UserId, user_role::Column::RoleId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;
        tracing::info!(user_id, role_id, "Role assigned");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_role_from_user(
        &self,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), ServiceError> {
        let admin_role_name = self.admin_role_name.clone();
        self.coordinator
            .in_transaction(self.db.as_ref(), "remove_role_from_user", |txn| {
                let user_id = user_id.to_string();
                let role_id = role_id.to_string();
                let admin_role_name = admin_role_name.clone();
                Box::pin(async move {
                    let role = lock_role(txn, &role_id).await?;
                    if role.name == admin_role_name {
                        guard_last_admin(txn, &role.id, &user_id).await?;
                    }
                    user_role::Entity::delete_many()
                        .filter(user_role::Column::UserId.eq(user_id.as_str()))
                        .filter(user_role::Column::RoleId.eq(role_id.as_str()))
                        .exec(txn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Replace the user's whole role set.
    #[tracing::instrument(skip(self, role_ids), fields(count = role_ids.len()))]
    pub async fn set_user_roles(
        &self,
        user_id: &str,
        role_ids: &[String],
        assigned_by: Option<&str>,
    ) -> Result<(), ServiceError> {
        let role_ids = dedupe(role_ids);
        let admin_role_name = self.admin_role_name.clone();
        let assigned_by = assigned_by.map(String::from);

        self.coordinator
            .in_transaction(self.db.as_ref(), "set_user_roles", |txn| {
                let user_id = user_id.to_string();
                let role_ids = role_ids.clone();
                let admin_role_name = admin_role_name.clone();
                let assigned_by = assigned_by.clone();
                Box::pin(async move {
                    user::Entity::find_by_id(user_id.clone())
                        .lock_exclusive()
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))?;

                    if !role_ids.is_empty() {
                        let found = role::Entity::find()
                            .filter(role::Column::Id.is_in(role_ids.iter().cloned()))
                            .count(txn)
                            .await?;
                        if found != role_ids.len() as u64 {
                            return Err(ServiceError::Validation("unknown role id".into()));
                        }
                    }

                    let admin = role::Entity::find()
                        .filter(role::Column::Name.eq(admin_role_name.as_str()))
                        .one(txn)
                        .await?;
                    if let Some(admin) = admin {
                        if !role_ids.contains(&admin.id) {
                            guard_last_admin(txn, &admin.id, &user_id).await?;
                        }
                    }

                    user_role::Entity::delete_many()
                        .filter(user_role::Column::UserId.eq(user_id.as_str()))
                        .exec(txn)
                        .await?;

                    if role_ids.is_empty() {
                        return Ok(());
                    }
                    let now = OffsetDateTime::now_utc();
                    let rows = role_ids.iter().map(|role_id| user_role::ActiveModel {
                        user_id: Set(user_id.clone()),
                        role_id: Set(role_id.clone()),
                        assigned_at: Set(now),
                        assigned_by: Set(assigned_by.clone()),
                    });
                    user_role::Entity::insert_many(rows)
                        .exec_without_returning(txn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }
}
