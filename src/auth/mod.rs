//! Authentication: validation of externally-issued JWTs and role guards.
//!
//! Token issuance and registration live in a separate service; this side
//! only validates HS256 tokens whose claims carry the subject id and one of
//! the three marketplace roles.

pub mod extract;
pub mod jwt;
pub mod models;

pub use extract::AuthClaims;
pub use jwt::JwtHandler;
pub use models::{Claims, Role};

use uuid::Uuid;

use crate::errors::MarketError;

/// The caller must hold the farmer role; returns their id.
pub fn require_farmer(claims: &Claims) -> Result<Uuid, MarketError> {
    require_role(claims, Role::Farmer)
}

pub fn require_buyer(claims: &Claims) -> Result<Uuid, MarketError> {
    require_role(claims, Role::Buyer)
}

pub fn require_middleman(claims: &Claims) -> Result<Uuid, MarketError> {
    require_role(claims, Role::Middleman)
}

fn require_role(claims: &Claims, role: Role) -> Result<Uuid, MarketError> {
    if claims.role != role {
        return Err(MarketError::Forbidden("Insufficient role"));
    }
    claims.user_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_guards() {
        let id = Uuid::new_v4();
        let claims = Claims {
            sub: id.to_string(),
            role: Role::Farmer,
            exp: 4_000_000_000,
        };
        assert_eq!(require_farmer(&claims).unwrap(), id);
        assert!(matches!(
            require_buyer(&claims),
            Err(MarketError::Forbidden(_))
        ));
        assert!(matches!(
            require_middleman(&claims),
            Err(MarketError::Forbidden(_))
        ));
    }

    #[test]
    fn test_malformed_subject_rejected() {
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            role: Role::Buyer,
            exp: 4_000_000_000,
        };
        assert!(require_buyer(&claims).is_err());
    }
}
