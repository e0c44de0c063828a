use thiserror::Error;

use vayva_core::{TenantId, UserId};

use crate::{JwtClaims, Permission, Role, permissions_for_roles};

/// A resolved caller for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    /// Resolve effective permissions from validated claims.
    pub fn from_claims(claims: &JwtClaims) -> Self {
        Self {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            roles: claims.roles.clone(),
            permissions: permissions_for_roles(&claims.roles),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Pure policy check: does `principal` hold `required`?
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal
        .permissions
        .iter()
        .any(|p| p.is_wildcard() || p == required)
    {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Authorize access to a resource owned by `owner`.
///
/// Cross-tenant access is rejected before permissions are consulted.
pub fn authorize_owned(
    principal: &Principal,
    owner: TenantId,
    required: &Permission,
) -> Result<(), AuthzError> {
    if principal.tenant_id != owner {
        return Err(AuthzError::TenantMismatch);
    }
    authorize(principal, required)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn principal(roles: Vec<Role>) -> Principal {
        let now = Utc::now();
        Principal::from_claims(&JwtClaims {
            sub: UserId::new(),
            tenant_id: TenantId::new(),
            roles,
            issued_at: now,
            expires_at: now + Duration::hours(1),
        })
    }

    #[test]
    fn admin_wildcard_allows_everything() {
        let p = principal(vec![Role::ADMIN]);
        assert!(authorize(&p, &Permission::DEAD_LETTERS_MANAGE).is_ok());
        assert!(authorize(&p, &Permission::new("anything.at_all")).is_ok());
    }

    #[test]
    fn viewer_is_forbidden_from_transitions() {
        let p = principal(vec![Role::VIEWER]);
        assert_eq!(
            authorize(&p, &Permission::SHIPMENTS_TRANSITION),
            Err(AuthzError::Forbidden("shipments.transition".to_string()))
        );
    }

    #[test]
    fn owned_resources_reject_other_tenants_first() {
        let p = principal(vec![Role::ADMIN]);
        assert_eq!(
            authorize_owned(&p, TenantId::new(), &Permission::SHIPMENTS_READ),
            Err(AuthzError::TenantMismatch)
        );
        assert!(authorize_owned(&p, p.tenant_id, &Permission::SHIPMENTS_READ).is_ok());
    }
}
