//! Application state shared across handlers, sockets, and monitors.

use std::sync::Arc;

use crate::auth::JwtHandler;
use crate::config::Config;
use crate::db::MarketStore;
use crate::fabric::EventFabric;
use crate::payments::StripeClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MarketStore>,
    pub fabric: Arc<EventFabric>,
    pub stripe: Arc<StripeClient>,
    pub jwt: Arc<JwtHandler>,
    pub http_client: reqwest::Client,
}
