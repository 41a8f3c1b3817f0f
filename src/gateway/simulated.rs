use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    AttemptStage, CardData, GatewayError, GatewayResponse, IntegritySigner, PaymentGateway,
    PaymentRequest,
};

/// Local stand-in for the processor: cards whose last digit is even are
/// approved, odd ones declined. Responses mirror the processor's shape so
/// the rest of the checkout flow cannot tell the difference.
#[derive(Debug)]
pub struct SimulatedGateway {
    signer: IntegritySigner,
    issued: RwLock<HashMap<String, Value>>,
}

impl SimulatedGateway {
    pub fn new(integrity_secret: &str) -> Result<Self, GatewayError> {
        Ok(Self {
            signer: IntegritySigner::new(integrity_secret)?,
            issued: RwLock::new(HashMap::new()),
        })
    }

    fn approves(card: &CardData) -> bool {
        card.number
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map(|digit| digit % 2 == 0)
            .unwrap_or(false)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn get_acceptance_token(&self) -> Result<String, GatewayError> {
        Ok(format!("sim_acceptance_{}", Uuid::new_v4().simple()))
    }

    async fn create_payment_token(&self, card: &CardData) -> Result<String, GatewayError> {
        if card.number.len() < 12 {
            return Err(GatewayError::Rejected {
                stage: AttemptStage::AcceptanceTokenObtained,
                status: 422,
                message: "Card number is not valid".into(),
            });
        }
        Ok(format!("tok_sim_{}", Uuid::new_v4().simple()))
    }

    #[instrument(skip(self, request, card), fields(reference = %request.reference))]
    async fn process_payment(
        &self,
        request: &PaymentRequest,
        card: &CardData,
    ) -> Result<GatewayResponse, GatewayError> {
        request.ensure_chargeable()?;
        self.get_acceptance_token().await?;
        let token = self.create_payment_token(card).await?;

        let approved = Self::approves(card);
        let now = Utc::now().to_rfc3339();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("sim_{}_{}", Utc::now().timestamp_millis(), &suffix[..6]);
        let response = json!({
            "data": {
                "id": id,
                "amount_in_cents": request.amount_in_cents,
                "reference": request.reference,
                "customer_email": request.customer_email,
                "currency": request.currency,
                "payment_method_type": "CARD",
                "payment_method": {
                    "type": "CARD",
                    "token": token,
                    "extra": {
                        "bin": card.bin(),
                        "last_four": card.last_four(),
                        "name": card.card_holder,
                        "brand": card.brand(),
                        "exp_month": card.exp_month,
                        "exp_year": card.exp_year,
                    }
                },
                "status": if approved { "APPROVED" } else { "DECLINED" },
                "status_message": if approved { "Transaction approved" } else { "Transaction declined" },
                "created_at": now,
                "finalized_at": now,
            }
        });

        self.issued.write().await.insert(id.clone(), response.clone());
        info!(gateway_id = %id, approved, "simulated charge settled");
        Ok(GatewayResponse(response))
    }

    async fn get_transaction_status(
        &self,
        gateway_id: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        self.issued
            .read()
            .await
            .get(gateway_id)
            .cloned()
            .map(GatewayResponse)
            .ok_or_else(|| GatewayError::Rejected {
                stage: AttemptStage::StatusLookup,
                status: 404,
                message: format!("Transaction {} not found", gateway_id),
            })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        self.signer.verify(payload, signature)
    }
}
