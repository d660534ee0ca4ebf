//! Typed domain errors and their HTTP mapping.
//!
//! These are domain signals, not panics: handlers roll back their transaction
//! on any of them and translate to a status at the boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::models::{BidStatus, EscrowStatus, OrderStatus};

#[derive(Debug)]
pub enum MarketError {
    OrderNotFound(Uuid),
    BidNotFound(Uuid),
    AssignmentNotFound(Uuid),
    EscrowMissing(Uuid),
    NotFound(&'static str),
    /// Missing or invalid token.
    Unauthorized,
    /// Wrong role or non-owner.
    Forbidden(&'static str),
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
    },
    InvalidBidState {
        current: BidStatus,
    },
    InvalidEscrowState {
        current: EscrowStatus,
        expected: EscrowStatus,
    },
    InsufficientVolume {
        requested_kg: f64,
        available_kg: f64,
    },
    /// QR hash mismatch or malformed signature.
    InvalidToken(&'static str),
    /// Request body failed semantic validation.
    Validation(&'static str),
    Conflict(String),
    /// Payment-processor failure on create/capture paths (propagated).
    Processor(String),
    Db(rusqlite::Error),
}

impl std::fmt::Display for MarketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketError::OrderNotFound(id) => write!(f, "Order {} not found", id),
            MarketError::BidNotFound(id) => write!(f, "Bid {} not found", id),
            MarketError::AssignmentNotFound(id) => write!(f, "Assignment {} not found", id),
            MarketError::EscrowMissing(order_id) => {
                write!(f, "No escrow found for order {}", order_id)
            }
            MarketError::NotFound(what) => write!(f, "{} not found", what),
            MarketError::Unauthorized => write!(f, "Invalid or expired token"),
            MarketError::Forbidden(msg) => write!(f, "{}", msg),
            MarketError::InvalidTransition { from, to } => {
                write!(f, "Cannot transition from {} to {}", from.as_str(), to.as_str())
            }
            MarketError::InvalidBidState { current } => {
                write!(f, "Bid is {}, expected PENDING", current.as_str())
            }
            MarketError::InvalidEscrowState { current, expected } => {
                write!(
                    f,
                    "Escrow is in {}, expected {}",
                    current.as_str(),
                    expected.as_str()
                )
            }
            MarketError::InsufficientVolume {
                requested_kg,
                available_kg,
            } => write!(
                f,
                "Requested {} kg exceeds available {} kg",
                requested_kg, available_kg
            ),
            MarketError::InvalidToken(msg) => write!(f, "{}", msg),
            MarketError::Validation(msg) => write!(f, "{}", msg),
            MarketError::Conflict(msg) => write!(f, "{}", msg),
            MarketError::Processor(msg) => write!(f, "Payment processor error: {}", msg),
            MarketError::Db(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for MarketError {}

impl From<rusqlite::Error> for MarketError {
    fn from(e: rusqlite::Error) -> Self {
        MarketError::Db(e)
    }
}

impl MarketError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MarketError::OrderNotFound(_)
            | MarketError::BidNotFound(_)
            | MarketError::AssignmentNotFound(_)
            | MarketError::NotFound(_) => StatusCode::NOT_FOUND,
            MarketError::Unauthorized => StatusCode::UNAUTHORIZED,
            MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
            MarketError::EscrowMissing(_)
            | MarketError::InvalidTransition { .. }
            | MarketError::InvalidBidState { .. }
            | MarketError::InvalidEscrowState { .. }
            | MarketError::InsufficientVolume { .. }
            | MarketError::Conflict(_) => StatusCode::CONFLICT,
            MarketError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            MarketError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MarketError::Processor(_) => StatusCode::BAD_GATEWAY,
            MarketError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {}", self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(
            MarketError::OrderNotFound(id).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(MarketError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            MarketError::Forbidden("Not your listing").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MarketError::InvalidTransition {
                from: OrderStatus::Settled,
                to: OrderStatus::Listed,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MarketError::InsufficientVolume {
                requested_kg: 50.0,
                available_kg: 40.0,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MarketError::InvalidToken("Invalid QR token").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MarketError::Processor("boom".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_transition_error_message_names_both_states() {
        let err = MarketError::InvalidTransition {
            from: OrderStatus::Listed,
            to: OrderStatus::Settled,
        };
        let msg = err.to_string();
        assert!(msg.contains("LISTED"));
        assert!(msg.contains("SETTLED"));
    }
}
