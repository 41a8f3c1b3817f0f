//! End-to-end checkout: create the transaction, open a payment, charge the
//! card, reconcile the outcome.

use metrics::counter;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::transactions::{NewTransaction, PaymentOutcome, TransactionService};
use crate::{
    entities::{payment, transaction, CustomerInfo, LineItem, PaymentStatus},
    errors::ServiceError,
    gateway::{CardData, GatewayResponse, PaymentGateway, PaymentRequest},
};

/// Everything needed to check out a cart in one call.
#[derive(Debug, Clone)]
pub struct CompletePayment {
    pub line_items: Vec<LineItem>,
    pub customer_info: CustomerInfo,
    pub total_amount: Decimal,
    pub tax_rate: Option<Decimal>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub card: CardData,
}

#[derive(Debug, Clone)]
pub struct CheckoutResult {
    pub transaction: transaction::Model,
    pub payment: payment::Model,
    /// Exactly what was stored on the payment
    pub gateway_response: Value,
}

/// Converts a charge into minor units of the currency the processor settles
/// in. USD is settled in COP at `usd_to_cop_rate`; everything else passes
/// through.
pub fn settlement_amount(
    total: Decimal,
    currency: &str,
    usd_to_cop_rate: Decimal,
) -> Result<(i64, String), ServiceError> {
    let (amount, settle_in) = if currency.eq_ignore_ascii_case("USD") {
        (total * usd_to_cop_rate, "COP".to_string())
    } else {
        (total, currency.to_ascii_uppercase())
    };

    let minor = (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("Amount is out of range".into()))?;

    Ok((minor, settle_in))
}

#[derive(Clone)]
pub struct CheckoutService {
    transactions: Arc<TransactionService>,
    gateway: Arc<dyn PaymentGateway>,
    default_currency: String,
    usd_to_cop_rate: Decimal,
}

impl CheckoutService {
    pub fn new(
        transactions: Arc<TransactionService>,
        gateway: Arc<dyn PaymentGateway>,
        default_currency: impl Into<String>,
        usd_to_cop_rate: Decimal,
    ) -> Self {
        Self {
            transactions,
            gateway,
            default_currency: default_currency.into(),
            usd_to_cop_rate,
        }
    }

    /// Stock and ledger failures propagate before anything is charged. Once
    /// the payment row exists, every gateway failure is recorded as a
    /// DECLINED payment instead of an error, so the payment always ends
    /// terminal.
    #[instrument(skip(self, request), fields(lines = request.line_items.len(), total = %request.total_amount))]
    pub async fn complete_payment(
        &self,
        request: CompletePayment,
    ) -> Result<CheckoutResult, ServiceError> {
        let CompletePayment {
            line_items,
            customer_info,
            total_amount,
            tax_rate,
            currency,
            description,
            card,
        } = request;

        let currency = currency
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_currency.clone());
        let (amount_in_cents, settlement_currency) =
            settlement_amount(total_amount, &currency, self.usd_to_cop_rate)?;
        let customer_email = customer_info.email.clone();

        let created = self
            .transactions
            .create_transaction(NewTransaction {
                line_items,
                customer_info,
                total_amount,
                tax_rate,
                currency: Some(currency),
            })
            .await?;

        let pending = self
            .transactions
            .create_payment(created.id, created.total_amount)
            .await?;

        let charge = PaymentRequest {
            amount_in_cents,
            currency: settlement_currency,
            reference: created.transaction_number.clone(),
            customer_email,
            description,
        };

        let card_summary = card.summary();
        let (status, gateway_response, card_summary) =
            match self.gateway.process_payment(&charge, &card).await {
                Ok(response) => {
                    let status = if response.is_approved() {
                        PaymentStatus::Approved
                    } else {
                        info!(
                            transaction_id = %created.id,
                            gateway_status = response.status().unwrap_or("UNKNOWN"),
                            reason = response.status_message().unwrap_or(""),
                            "charge not approved"
                        );
                        PaymentStatus::Declined
                    };
                    let summary = card_summary.with_token(response.payment_token());
                    (status, response.into_inner(), summary)
                }
                Err(err) => {
                    warn!(
                        transaction_id = %created.id,
                        payment_id = %pending.id,
                        error = %err,
                        stage = ?err.stage(),
                        "gateway call failed; recording payment as declined"
                    );
                    counter!("checkout.gateway.absorbed_errors", 1, "kind" => err.kind());
                    (PaymentStatus::Declined, err.to_audit_record(), card_summary)
                }
            };
        drop(card);

        let reconciled = self
            .transactions
            .reconcile_payment_outcome(
                pending.id,
                PaymentOutcome::new(status)
                    .with_gateway_response(gateway_response.clone())
                    .with_card(card_summary),
            )
            .await?;

        let transaction = self
            .transactions
            .find_by_id(created.id)
            .await?
            .map(|found| found.transaction)
            .ok_or_else(|| ServiceError::TransactionNotFound(created.id.to_string()))?;

        info!(
            transaction_number = %transaction.transaction_number,
            transaction_status = %transaction.status,
            payment_status = %reconciled.payment.status,
            "Checkout completed"
        );
        counter!("checkout.payments.completed", 1, "status" => reconciled.payment.status.to_string());

        Ok(CheckoutResult {
            transaction,
            payment: reconciled.payment,
            gateway_response,
        })
    }

    /// Asks the processor for the current state of a payment's charge.
    /// Read-only: nothing is reconciled.
    #[instrument(skip(self))]
    pub async fn gateway_status(&self, payment_id: Uuid) -> Result<GatewayResponse, ServiceError> {
        let payment = self
            .transactions
            .find_payment(payment_id)
            .await?
            .ok_or(ServiceError::PaymentNotFound(payment_id))?;

        let gateway_id = payment.gateway_transaction_id.ok_or_else(|| {
            ServiceError::InvalidState(format!(
                "Payment {} has no gateway transaction id yet",
                payment_id
            ))
        })?;

        Ok(self.gateway.get_transaction_status(&gateway_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cop_passes_through_in_minor_units() {
        assert_eq!(
            settlement_amount(dec!(100000), "COP", dec!(4000)).unwrap(),
            (10_000_000, "COP".to_string())
        );
    }

    #[test]
    fn usd_is_settled_in_cop() {
        assert_eq!(
            settlement_amount(dec!(25.50), "usd", dec!(4000)).unwrap(),
            (10_200_000, "COP".to_string())
        );
    }

    #[test]
    fn fractional_minor_units_round_half_away_from_zero() {
        assert_eq!(
            settlement_amount(dec!(10.005), "COP", dec!(4000)).unwrap().0,
            1001
        );
    }

    #[test]
    fn other_currencies_are_uppercased() {
        assert_eq!(
            settlement_amount(dec!(12), "eur", dec!(4000)).unwrap(),
            (1200, "EUR".to_string())
        );
    }
}
