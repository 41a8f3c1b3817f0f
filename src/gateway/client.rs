use async_trait::async_trait;
use metrics::counter;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{
    AttemptStage, CardData, GatewayError, GatewayResponse, IntegritySigner, PaymentGateway,
    PaymentRequest,
};
use crate::config::GatewayConfig;

/// Signed HTTP integration with the card processor's REST API.
#[derive(Clone, Debug)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    public_key: String,
    private_key: String,
    signer: IntegritySigner,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            public_key: config.public_key.clone(),
            private_key: config.private_key.clone(),
            signer: IntegritySigner::new(&config.integrity_secret)?,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Integrity signature over the given fields, as the processor computes it.
    pub fn generate_signature<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> String
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.signer.sign_fields(fields)
    }

    /// Sends a request and returns the decoded JSON body, mapping every failure
    /// mode onto a [`GatewayError`] tagged with `stage`.
    async fn send(
        &self,
        stage: AttemptStage,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, GatewayError> {
        counter!("checkout_gateway.requests", 1, "stage" => stage.to_string());

        let response = request.send().await.map_err(|e| self.transport_error(stage, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(stage, e))?;

        if !status.is_success() {
            counter!("checkout_gateway.failures", 1, "stage" => stage.to_string());
            let message = processor_error_message(&body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("processor error")
                    .to_string()
            });
            warn!(%stage, status = status.as_u16(), %message, "payment processor rejected request");
            return Err(GatewayError::Rejected {
                stage,
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse {
            stage,
            message: format!("response body is not JSON: {}", e),
        })
    }

    fn transport_error(&self, stage: AttemptStage, err: reqwest::Error) -> GatewayError {
        counter!("checkout_gateway.failures", 1, "stage" => stage.to_string());
        if err.is_timeout() {
            warn!(%stage, timeout = ?self.timeout, "payment processor timed out");
            GatewayError::Timeout {
                stage,
                timeout: self.timeout,
            }
        } else {
            warn!(%stage, error = %err, "payment processor unreachable");
            GatewayError::Transport {
                stage,
                message: err.to_string(),
            }
        }
    }

    async fn fetch_acceptance_token(&self, stage: AttemptStage) -> Result<String, GatewayError> {
        let body = self
            .send(
                stage,
                self.client
                    .get(self.url(&format!("merchants/{}", self.public_key))),
            )
            .await?;

        string_at(&body, &["data", "presigned_acceptance", "acceptance_token"]).ok_or_else(|| {
            GatewayError::InvalidResponse {
                stage,
                message: "missing data.presigned_acceptance.acceptance_token".into(),
            }
        })
    }

    async fn tokenize_card(
        &self,
        stage: AttemptStage,
        card: &CardData,
    ) -> Result<String, GatewayError> {
        let payload = json!({
            "number": card.number,
            "cvc": card.cvc,
            "exp_month": card.exp_month,
            "exp_year": card.exp_year,
            "card_holder": card.card_holder,
        });

        let body = self
            .send(
                stage,
                self.client
                    .post(self.url("tokens/cards"))
                    .bearer_auth(&self.public_key)
                    .json(&payload),
            )
            .await?;

        string_at(&body, &["data", "id"]).ok_or_else(|| GatewayError::InvalidResponse {
            stage,
            message: "missing data.id in tokenization response".into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    #[instrument(skip(self))]
    async fn get_acceptance_token(&self) -> Result<String, GatewayError> {
        self.fetch_acceptance_token(AttemptStage::Init).await
    }

    #[instrument(skip(self, card))]
    async fn create_payment_token(&self, card: &CardData) -> Result<String, GatewayError> {
        self.tokenize_card(AttemptStage::AcceptanceTokenObtained, card)
            .await
    }

    #[instrument(
        skip(self, request, card),
        fields(reference = %request.reference, amount_in_cents = request.amount_in_cents)
    )]
    async fn process_payment(
        &self,
        request: &PaymentRequest,
        card: &CardData,
    ) -> Result<GatewayResponse, GatewayError> {
        request.ensure_chargeable()?;

        let acceptance_token = self.fetch_acceptance_token(AttemptStage::Init).await?;
        debug!(stage = %AttemptStage::AcceptanceTokenObtained, "acceptance token obtained");

        let payment_token = self
            .tokenize_card(AttemptStage::AcceptanceTokenObtained, card)
            .await?;
        debug!(stage = %AttemptStage::CardTokenized, "card tokenized");

        let amount = request.amount_in_cents.to_string();
        let signature = self.generate_signature([
            ("amount_in_cents", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("reference", request.reference.as_str()),
            ("public_key", self.public_key.as_str()),
            ("acceptance_token", acceptance_token.as_str()),
        ]);
        debug!(stage = %AttemptStage::Signed, "charge signed");

        let mut charge = json!({
            "acceptance_token": acceptance_token,
            "amount_in_cents": request.amount_in_cents,
            "currency": request.currency,
            "customer_email": request.customer_email,
            "reference": request.reference,
            "public_key": self.public_key,
            "signature": signature,
            "payment_method": {
                "type": "CARD",
                "installments": 1,
                "token": payment_token,
            },
        });
        if let Some(description) = &request.description {
            charge["description"] = Value::String(description.clone());
        }

        let body = self
            .send(
                AttemptStage::Signed,
                self.client
                    .post(self.url("transactions"))
                    .bearer_auth(&self.public_key)
                    .json(&charge),
            )
            .await?;

        let response = GatewayResponse(body);
        info!(
            stage = %AttemptStage::Submitted,
            gateway_id = response.gateway_id().as_deref().unwrap_or(""),
            status = response.status().unwrap_or("UNKNOWN"),
            "charge submitted"
        );
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn get_transaction_status(
        &self,
        gateway_id: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let body = self
            .send(
                AttemptStage::StatusLookup,
                self.client
                    .get(self.url(&format!("transactions/{}", gateway_id)))
                    .bearer_auth(&self.private_key),
            )
            .await?;
        Ok(GatewayResponse(body))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        self.signer.verify(payload, signature)
    }
}

fn string_at(body: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(body, |node, key| node.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Best-effort extraction of the processor's own error message.
fn processor_error_message(body: &str) -> Option<String> {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            let trimmed = body.trim();
            return (!trimmed.is_empty()).then(|| trimmed.chars().take(500).collect());
        }
    };
    let error = parsed.get("error").unwrap_or(&parsed);

    for key in ["reason", "message"] {
        if let Some(text) = error.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    if let Some(messages) = error.get("messages") {
        return Some(messages.to_string());
    }
    error
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
}
