//! JWT validation (HS256).

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;
use uuid::Uuid;

use crate::auth::models::{Claims, Role};
use crate::errors::MarketError;

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Validate a token and extract its claims. Expiry is enforced.
    pub fn validate_token(&self, token: &str) -> Result<Claims, MarketError> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| MarketError::Unauthorized)?;

        debug!("validated token for {}", decoded.claims.sub);
        Ok(decoded.claims)
    }

    /// Decode a token carried in a WebSocket query parameter (headers are
    /// unavailable at upgrade time). Returns the subject id and role.
    pub fn decode_ws_token(&self, token: &str) -> Result<(Uuid, Role), MarketError> {
        let claims = self.validate_token(token)?;
        Ok((claims.user_id()?, claims.role))
    }

    /// Mint a token. Issuance lives in the auth service; this exists for
    /// local development and tests.
    pub fn generate_token(&self, user_id: Uuid, role: Role) -> Result<String, MarketError> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::hours(24))
            .ok_or(MarketError::Unauthorized)?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp: expiration,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|_| MarketError::Unauthorized)
    }
}
