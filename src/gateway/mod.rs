//! Card-payment processor integration.
//!
//! [`PaymentGateway`] is the seam the checkout flow talks to. [`HttpGateway`]
//! is the signed HTTP integration used in every real deployment;
//! [`SimulatedGateway`] approves or declines locally and exists for tests and
//! demos only.

mod card;
pub mod client;
pub mod signature;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{GatewayConfig, GatewayMode};

pub use card::{detect_card_brand, CardBrand, CardData, CardSummary};
pub use client::HttpGateway;
pub use signature::IntegritySigner;
pub use simulated::SimulatedGateway;

/// Smallest chargeable amount, in minor currency units.
pub const MIN_AMOUNT_IN_CENTS: i64 = 1000;

/// Header carrying the processor's signature on inbound webhooks.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-gateway-signature";

/// How far a single payment attempt got before it finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStage {
    Init,
    AcceptanceTokenObtained,
    CardTokenized,
    Signed,
    Submitted,
    StatusLookup,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Amount too low. Minimum amount is {minimum} minor units, received {amount_in_cents}")]
    AmountTooLow { amount_in_cents: i64, minimum: i64 },

    #[error("Payment gateway timed out after {timeout:?} at stage {stage}")]
    Timeout {
        stage: AttemptStage,
        timeout: Duration,
    },

    #[error("Payment gateway unreachable at stage {stage}: {message}")]
    Transport { stage: AttemptStage, message: String },

    #[error("Payment gateway rejected the request at stage {stage} (HTTP {status}): {message}")]
    Rejected {
        stage: AttemptStage,
        status: u16,
        message: String,
    },

    #[error("Unexpected payment gateway response at stage {stage}: {message}")]
    InvalidResponse { stage: AttemptStage, message: String },

    #[error("Payment gateway misconfigured: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn stage(&self) -> Option<AttemptStage> {
        match self {
            GatewayError::AmountTooLow { .. } => Some(AttemptStage::Init),
            GatewayError::Timeout { stage, .. }
            | GatewayError::Transport { stage, .. }
            | GatewayError::Rejected { stage, .. }
            | GatewayError::InvalidResponse { stage, .. } => Some(*stage),
            GatewayError::Configuration(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AmountTooLow { .. } => "AMOUNT_TOO_LOW",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Transport { .. } => "TRANSPORT_ERROR",
            GatewayError::Rejected { .. } => "PROCESSOR_REJECTED",
            GatewayError::InvalidResponse { .. } => "INVALID_RESPONSE",
            GatewayError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Audit record stored in place of a processor response when the
    /// attempt failed before the processor produced one.
    pub fn to_audit_record(&self) -> Value {
        json!({
            "error": {
                "type": self.kind(),
                "stage": self.stage(),
                "message": self.to_string(),
            }
        })
    }
}

/// Charge parameters. The amount is already in minor units of `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount_in_cents: i64,
    pub currency: String,
    /// Merchant reference, the transaction number
    pub reference: String,
    pub customer_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequest {
    pub fn ensure_chargeable(&self) -> Result<(), GatewayError> {
        if self.amount_in_cents < MIN_AMOUNT_IN_CENTS {
            return Err(GatewayError::AmountTooLow {
                amount_in_cents: self.amount_in_cents,
                minimum: MIN_AMOUNT_IN_CENTS,
            });
        }
        Ok(())
    }
}

/// Raw processor response, passed through untouched for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayResponse(pub Value);

impl GatewayResponse {
    /// The processor wraps most payloads in `data`; fall back to the root.
    fn field(&self, name: &str) -> Option<&Value> {
        self.0
            .get("data")
            .and_then(|data| data.get(name))
            .or_else(|| self.0.get(name))
    }

    pub fn status(&self) -> Option<&str> {
        self.field("status").and_then(Value::as_str)
    }

    pub fn status_message(&self) -> Option<&str> {
        self.field("status_message").and_then(Value::as_str)
    }

    pub fn is_approved(&self) -> bool {
        self.status() == Some("APPROVED")
    }

    /// Processor transaction id: `data.id`, then `id`, then `transaction_id`.
    pub fn gateway_id(&self) -> Option<String> {
        self.field("id")
            .or_else(|| self.0.get("transaction_id"))
            .and_then(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn payment_token(&self) -> Option<&str> {
        self.field("payment_method")
            .and_then(|method| method.get("token"))
            .and_then(Value::as_str)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<Value> for GatewayResponse {
    fn from(value: Value) -> Self {
        GatewayResponse(value)
    }
}

/// Outbound operations against the payment processor plus webhook verification.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short-lived merchant acceptance token required for every charge.
    async fn get_acceptance_token(&self) -> Result<String, GatewayError>;

    /// Exchanges raw card fields for a single-use payment token.
    async fn create_payment_token(&self, card: &CardData) -> Result<String, GatewayError>;

    /// Full charge attempt: minimum check, acceptance token, tokenization,
    /// signing and submission. No retries.
    async fn process_payment(
        &self,
        request: &PaymentRequest,
        card: &CardData,
    ) -> Result<GatewayResponse, GatewayError>;

    async fn get_transaction_status(&self, gateway_id: &str)
        -> Result<GatewayResponse, GatewayError>;

    /// Mismatch is an expected outcome and returns `false`.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;
}

/// Builds the gateway selected by `config.mode`.
pub fn from_config(config: &GatewayConfig) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
    match config.mode {
        GatewayMode::Live => {
            tracing::info!(base_url = %config.base_url, "using HTTP payment gateway");
            Ok(Arc::new(HttpGateway::new(config)?))
        }
        GatewayMode::Simulated => {
            tracing::warn!("using simulated payment gateway; no real charges will be made");
            Ok(Arc::new(SimulatedGateway::new(&config.integrity_secret)?))
        }
    }
}
