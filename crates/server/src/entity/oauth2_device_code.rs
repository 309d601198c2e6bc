//! OAuth2 Device Code entity (RFC 8628).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_device_code")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub device_code_hash: String,
    /// Human-entered code, `XXXX-XXXX`
    #[sea_orm(unique)]
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub status: String,
    /// Set once the user approves
    pub user_id: Option<String>,
    /// Minimum seconds between polls
    pub interval: i64,
    pub last_polled_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self) -> bool {
        self.expires_at < OffsetDateTime::now_utc()
    }

    pub fn status(&self) -> Option<DeviceCodeStatus> {
        self.status.parse().ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCodeStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    /// Tokens were issued; terminal.
    Consumed,
}

impl DeviceCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCodeStatus::Pending => "pending",
            DeviceCodeStatus::Approved => "approved",
            DeviceCodeStatus::Denied => "denied",
            DeviceCodeStatus::Expired => "expired",
            DeviceCodeStatus::Consumed => "consumed",
        }
    }
}

impl fmt::Display for DeviceCodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceCodeStatus::Pending),
            "approved" => Ok(DeviceCodeStatus::Approved),
            "denied" => Ok(DeviceCodeStatus::Denied),
            "expired" => Ok(DeviceCodeStatus::Expired),
            "consumed" => Ok(DeviceCodeStatus::Consumed),
            other => Err(format!("unknown device code status: {other}")),
        }
    }
}
