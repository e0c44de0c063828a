//! `vayva-auth`: authentication/authorization boundary for operator endpoints.
//!
//! This crate is decoupled from HTTP and storage.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod rbac;

pub use authorize::{AuthzError, Principal, authorize, authorize_owned};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
pub use rbac::{Permission, Role, permissions_for_roles};
