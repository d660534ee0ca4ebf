//! Claims payload and marketplace roles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::MarketError;

/// Marketplace roles carried in the JWT `role` claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "farmer")]
    Farmer,
    #[serde(rename = "buyer")]
    Buyer,
    #[serde(rename = "middleman")]
    Middleman,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Farmer => "farmer",
            Role::Buyer => "buyer",
            Role::Middleman => "middleman",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "farmer" => Some(Role::Farmer),
            "buyer" => Some(Role::Buyer),
            "middleman" => Some(Role::Middleman),
            _ => None,
        }
    }
}

/// JWT claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user id)
    pub role: Role,
    pub exp: usize, // expiration timestamp
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, MarketError> {
        Uuid::parse_str(&self.sub).map_err(|_| MarketError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Farmer).unwrap(), r#""farmer""#);
        let back: Role = serde_json::from_str(r#""middleman""#).unwrap();
        assert_eq!(back, Role::Middleman);
    }

    #[test]
    fn test_role_string_conversion() {
        assert_eq!(Role::from_str("farmer"), Some(Role::Farmer));
        assert_eq!(Role::from_str("BUYER"), Some(Role::Buyer));
        assert_eq!(Role::from_str("trader"), None);
    }
}
