//! HTTP and WebSocket handlers.

pub mod bids;
pub mod logistics;
pub mod middlemen;
pub mod orders;
pub mod verify;
pub mod webhooks;
pub mod ws;
