//! Profile Aggregate: user identity and role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "super_admin")] SuperAdmin,
    #[serde(rename = "administrador")] Administrator,
    #[serde(rename = "vendedor")] Seller,
    #[serde(rename = "inventario")] Inventory,
    #[serde(rename = "contable")] Accounting,
    #[default]
    #[serde(rename = "cliente")] Customer,
}

/// Operations gated by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    ManageCatalog,
    ManageInventory,
    ManageOrders,
    ViewAllOrders,
    ManageUsers,
    Sell,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Administrator => "administrador",
            Self::Seller => "vendedor",
            Self::Inventory => "inventario",
            Self::Accounting => "contable",
            Self::Customer => "cliente",
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Self::SuperAdmin | Self::Administrator => true,
            Self::Seller => matches!(permission, Sell | ManageOrders | ViewAllOrders),
            Self::Inventory => matches!(permission, ManageCatalog | ManageInventory),
            Self::Accounting => matches!(permission, ViewAllOrders),
            Self::Customer => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = ProfileError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Self::SuperAdmin),
            "administrador" => Ok(Self::Administrator),
            "vendedor" => Ok(Self::Seller),
            "inventario" => Ok(Self::Inventory),
            "contable" => Ok(Self::Accounting),
            "cliente" => Ok(Self::Customer),
            other => Err(ProfileError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    #[default]
    #[serde(rename = "activo")] Active,
    #[serde(rename = "inactivo")] Inactive,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Active => "activo", Self::Inactive => "inactivo" }
    }
}

impl FromStr for ProfileStatus {
    type Err = ProfileError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activo" => Ok(Self::Active),
            "inactivo" => Ok(Self::Inactive),
            other => Err(ProfileError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub company: Option<String>,
    pub role: Role,
    pub status: ProfileStatus,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ProfileDraft {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub company: Option<String>,
    pub role: Role,
}

impl Profile {
    pub fn register(draft: ProfileDraft) -> Result<Self, ProfileError> {
        let email = draft.email.trim().to_lowercase();
        if !email.contains('@') { return Err(ProfileError::InvalidEmail(email)); }
        if draft.first_name.trim().is_empty() || draft.last_name.trim().is_empty() {
            return Err(ProfileError::MissingName);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), email, first_name: draft.first_name.trim().to_string(),
            last_name: draft.last_name.trim().to_string(), phone: draft.phone, address: draft.address,
            company: draft.company, role: draft.role, status: ProfileStatus::Active,
            email_verified: false, created_at: now, updated_at: now,
        })
    }

    pub fn full_name(&self) -> String { format!("{} {}", self.first_name, self.last_name) }
    pub fn is_active(&self) -> bool { self.status == ProfileStatus::Active }
    pub fn can(&self, permission: Permission) -> bool { self.is_active() && self.role.can(permission) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("invalid email '{0}'")]
    InvalidEmail(String),
    #[error("first and last name are required")]
    MissingName,
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("unknown profile status '{0}'")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permissions() {
        assert!(Role::SuperAdmin.can(Permission::ManageUsers));
        assert!(Role::Inventory.can(Permission::ManageInventory));
        assert!(!Role::Inventory.can(Permission::ManageUsers));
        assert!(Role::Seller.can(Permission::ViewAllOrders));
        assert!(Role::Seller.can(Permission::Sell));
        assert!(!Role::Accounting.can(Permission::Sell));
        assert!(!Role::Customer.can(Permission::ViewAllOrders));
    }

    #[test]
    fn role_wire_names_round_trip() {
        for role in [Role::SuperAdmin, Role::Administrator, Role::Seller, Role::Inventory, Role::Accounting, Role::Customer] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
            assert_eq!(serde_json::to_value(role).unwrap(), role.as_str());
        }
    }

    #[test]
    fn register_normalizes_email() {
        let p = Profile::register(ProfileDraft {
            email: " Ana@Example.COM ".into(), first_name: "Ana".into(), last_name: "Torres".into(), ..Default::default()
        }).unwrap();
        assert_eq!(p.email, "ana@example.com");
        assert_eq!(p.role, Role::Customer);
        assert_eq!(p.full_name(), "Ana Torres");
        assert!(!p.email_verified);
    }

    #[test]
    fn inactive_profiles_have_no_permissions() {
        let mut p = Profile::register(ProfileDraft {
            email: "admin@example.com".into(), first_name: "A".into(), last_name: "B".into(), role: Role::SuperAdmin, ..Default::default()
        }).unwrap();
        p.status = ProfileStatus::Inactive;
        assert!(!p.can(Permission::ManageCatalog));
    }
}
