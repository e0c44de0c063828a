//! Roles, permissions, and the static role → permission policy.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier carried in tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const OPERATOR: Role = Role(Cow::Borrowed("operator"));
    pub const VIEWER: Role = Role(Cow::Borrowed("viewer"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permission identifier (e.g. `"shipments.transition"`).
///
/// The wildcard `"*"` grants everything within the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const SHIPMENTS_READ: Permission = Permission(Cow::Borrowed("shipments.read"));
    pub const SHIPMENTS_CREATE: Permission = Permission(Cow::Borrowed("shipments.create"));
    pub const SHIPMENTS_TRANSITION: Permission = Permission(Cow::Borrowed("shipments.transition"));
    pub const DEAD_LETTERS_READ: Permission = Permission(Cow::Borrowed("jobs.dead_letters.read"));
    pub const DEAD_LETTERS_MANAGE: Permission =
        Permission(Cow::Borrowed("jobs.dead_letters.manage"));
    /// Ownerless system jobs; no built-in role grants it except through `*`.
    pub const SYSTEM_JOBS_MANAGE: Permission = Permission(Cow::Borrowed("jobs.system.manage"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the effective permissions for a set of roles.
///
/// Unknown roles grant nothing.
pub fn permissions_for_roles(roles: &[Role]) -> Vec<Permission> {
    let mut granted: Vec<Permission> = Vec::new();
    for role in roles {
        let perms: &[Permission] = match role.as_str() {
            "admin" => &[Permission::WILDCARD],
            "operator" => &[
                Permission::SHIPMENTS_READ,
                Permission::SHIPMENTS_CREATE,
                Permission::SHIPMENTS_TRANSITION,
                Permission::DEAD_LETTERS_READ,
                Permission::DEAD_LETTERS_MANAGE,
            ],
            "viewer" => &[Permission::SHIPMENTS_READ],
            _ => &[],
        };
        for perm in perms {
            if !granted.contains(perm) {
                granted.push(perm.clone());
            }
        }
    }
    granted
}
