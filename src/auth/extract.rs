//! Claims extraction for protected handlers.
//!
//! The token arrives as an `Authorization: Bearer` credential, or — for
//! clients that cannot set headers, such as WebSocket upgrades — as a
//! `token` query parameter. Handlers take [`AuthClaims`] and then enforce
//! role and ownership themselves.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::auth::models::Claims;
use crate::errors::MarketError;
use crate::state::AppState;

pub struct AuthClaims(pub Claims);

fn credential_from_parts(parts: &Parts) -> Option<String> {
    let header_token = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| match raw.trim().split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
                Some(token.trim().to_string())
            }
            _ => None,
        });
    if header_token.is_some() {
        return header_token;
    }

    // Query-string fallback for header-less clients.
    let query = parts.uri.query()?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(key, value)| {
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
}

#[async_trait]
impl FromRequestParts<AppState> for AuthClaims {
    type Rejection = MarketError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = credential_from_parts(parts).ok_or(MarketError::Unauthorized)?;
        let claims = state.jwt.validate_token(&token)?;
        Ok(AuthClaims(claims))
    }
}
