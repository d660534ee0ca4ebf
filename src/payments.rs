//! Stripe client for the escrow machine.
//!
//! Thin REST wrapper: payment intents with deferred capture, connected-
//! account transfers, cancel/refund, and webhook signature verification.
//! With a placeholder secret key the client runs in demo mode and fabricates
//! deterministic-prefix `pi_demo_` handles without any network I/O.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::errors::MarketError;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const PLACEHOLDER_SECRET_PREFIX: &str = "sk_test_placeholder";
const PLACEHOLDER_WEBHOOK_SECRET: &str = "whsec_placeholder";

type HmacSha256 = Hmac<Sha256>;

pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct CreatedIntent {
    pub intent_id: String,
    pub client_secret: String,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, secret_key: String, webhook_secret: String) -> Self {
        Self {
            http,
            secret_key,
            webhook_secret,
        }
    }

    /// Demo mode is active when no real secret key is configured.
    pub fn demo_mode(&self) -> bool {
        self.secret_key.trim().is_empty() || self.secret_key.starts_with(PLACEHOLDER_SECRET_PREFIX)
    }

    pub fn is_demo_intent(intent_id: &str) -> bool {
        intent_id.starts_with("pi_demo_")
    }

    /// Create an authorization with capture deferred (manual capture).
    /// Returns the intent handle and the client-facing secret.
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        order_id: Uuid,
        escrow_id: Uuid,
    ) -> Result<CreatedIntent, MarketError> {
        if self.demo_mode() {
            let suffix = Uuid::new_v4().simple().to_string();
            return Ok(CreatedIntent {
                intent_id: format!("pi_demo_{}", &suffix[..20]),
                client_secret: format!("pi_demo_secret_{}", suffix),
            });
        }

        let body = self
            .post_form(
                &format!("{}/payment_intents", STRIPE_API_BASE),
                &[
                    ("amount", amount_cents.to_string()),
                    ("currency", "usd".to_string()),
                    ("capture_method", "manual".to_string()),
                    ("confirm", "false".to_string()),
                    ("metadata[order_id]", order_id.to_string()),
                    ("metadata[escrow_id]", escrow_id.to_string()),
                ],
            )
            .await?;

        let intent_id = string_field(&body, "id")?;
        let client_secret = string_field(&body, "client_secret")?;
        Ok(CreatedIntent {
            intent_id,
            client_secret,
        })
    }

    /// Capture a previously authorized intent. No-op for demo handles.
    pub async fn capture_intent(&self, intent_id: &str) -> Result<(), MarketError> {
        if Self::is_demo_intent(intent_id) {
            return Ok(());
        }
        self.post_form(
            &format!("{}/payment_intents/{}/capture", STRIPE_API_BASE, intent_id),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Transfer to a connected account. Returns the transfer handle.
    pub async fn create_transfer(
        &self,
        amount_cents: i64,
        destination: &str,
        transfer_group: &str,
        kind: &str,
    ) -> Result<String, MarketError> {
        let body = self
            .post_form(
                &format!("{}/transfers", STRIPE_API_BASE),
                &[
                    ("amount", amount_cents.to_string()),
                    ("currency", "usd".to_string()),
                    ("destination", destination.to_string()),
                    ("transfer_group", transfer_group.to_string()),
                    ("metadata[type]", kind.to_string()),
                    ("metadata[order_id]", transfer_group.to_string()),
                ],
            )
            .await?;
        string_field(&body, "id")
    }

    /// Cancel an authorization that has not been captured, or refund one
    /// that has. Demo handles are a no-op.
    pub async fn cancel_or_refund(&self, intent_id: &str) -> Result<(), MarketError> {
        if Self::is_demo_intent(intent_id) {
            return Ok(());
        }

        let intent = self
            .get(&format!("{}/payment_intents/{}", STRIPE_API_BASE, intent_id))
            .await?;
        let status = string_field(&intent, "status")?;

        match status.as_str() {
            "requires_capture" => {
                self.post_form(
                    &format!("{}/payment_intents/{}/cancel", STRIPE_API_BASE, intent_id),
                    &[],
                )
                .await?;
            }
            "succeeded" | "amount_capturable_updated" => {
                self.post_form(
                    &format!("{}/refunds", STRIPE_API_BASE),
                    &[
                        ("payment_intent", intent_id.to_string()),
                        ("reason", "requested_by_customer".to_string()),
                    ],
                )
                .await?;
            }
            // Nothing captured or capturable; nothing to unwind.
            _ => {}
        }
        Ok(())
    }

    /// Verify a `Stripe-Signature` header against the raw payload.
    ///
    /// Header format: `t=<unix>,v1=<hex hmac>[,v1=...]`, where the HMAC is
    /// SHA-256 over `"{t}.{payload}"`. With the placeholder webhook secret
    /// verification is skipped (development mode).
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<(), MarketError> {
        if self.webhook_secret == PLACEHOLDER_WEBHOOK_SECRET {
            return Ok(());
        }

        let header =
            signature_header.ok_or(MarketError::InvalidToken("Missing Stripe signature"))?;

        let mut timestamp: Option<&str> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or(MarketError::InvalidToken("Malformed Stripe signature"))?;
        if candidates.is_empty() {
            return Err(MarketError::InvalidToken("Malformed Stripe signature"));
        }

        let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
        signed.extend_from_slice(timestamp.as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(payload);

        for candidate in candidates {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
                .map_err(|_| MarketError::InvalidToken("Malformed webhook secret"))?;
            mac.update(&signed);
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }

        Err(MarketError::InvalidToken("Invalid Stripe signature"))
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<serde_json::Value, MarketError> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| MarketError::Processor(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn get(&self, url: &str) -> Result<serde_json::Value, MarketError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| MarketError::Processor(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<serde_json::Value, MarketError> {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MarketError::Processor(e.to_string()))?;

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("request failed");
            return Err(MarketError::Processor(format!("{} ({})", message, status)));
        }
        Ok(body)
    }
}

fn string_field(body: &serde_json::Value, field: &str) -> Result<String, MarketError> {
    body.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| MarketError::Processor(format!("response missing `{}`", field)))
}
