use vayva_auth::{Permission, Principal, Role, permissions_for_roles};
use vayva_core::{TenantId, UserId};

/// Tenant context for a request.
///
/// This is immutable and must be present for all operator routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Principal context for a request (authenticated identity + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    roles: Vec<Role>,
    permissions: Vec<Permission>,
}

impl PrincipalContext {
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        let permissions = permissions_for_roles(&roles);
        Self {
            user_id,
            roles,
            permissions,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    /// Resolve into the authorization model for the active tenant.
    pub fn principal(&self, tenant: &TenantContext) -> Principal {
        Principal {
            user_id: self.user_id,
            tenant_id: tenant.tenant_id(),
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        }
    }
}
