use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Checkout Payments API",
        version = "1.0.0",
        description = r#"
# Checkout Payments API

Records checkout transactions, charges cards through the payment processor and
reconciles the outcome against stock.

## Flow

1. `POST /api/v1/transactions/complete-payment` checks stock, creates a PENDING
   transaction and payment, charges the card and finalizes both records.
2. An approved payment completes the transaction and takes stock; a declined or
   failed one marks the transaction FAILED and leaves stock untouched.

Amounts are decimal strings in the transaction currency. The processor is
charged in minor units; USD checkouts are settled in COP.

## Error Handling

Errors share one body format:

```json
{
  "error": "Unprocessable Entity",
  "message": "Insufficient stock for product Wireless Mouse. Available: 10, Requested: 15",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development")
    ),
    tags(
        (name = "Transactions", description = "Transactions, payments and checkout"),
        (name = "Gateway", description = "Payment processor callbacks"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Transactions
        crate::handlers::transactions::create_transaction,
        crate::handlers::transactions::get_transaction,
        crate::handlers::transactions::get_transaction_by_number,
        crate::handlers::transactions::create_payment,
        crate::handlers::transactions::complete_payment,
        crate::handlers::transactions::update_payment_status,
        crate::handlers::transactions::get_gateway_status,

        // Webhooks
        crate::handlers::webhooks::gateway_webhook,

        // Health
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::handlers::transactions::CreateTransactionRequest,
            crate::handlers::transactions::CreatePaymentRequest,
            crate::handlers::transactions::CompletePaymentRequest,
            crate::handlers::transactions::CreditCardInput,
            crate::handlers::transactions::UpdatePaymentStatusRequest,
            crate::handlers::transactions::TransactionView,
            crate::handlers::transactions::PaymentView,
            crate::handlers::transactions::CheckoutView,
            crate::handlers::transactions::ReconciliationView,
            crate::handlers::webhooks::WebhookAck,
            crate::handlers::health::HealthResponse,
            crate::entities::TransactionStatus,
            crate::entities::PaymentStatus,
            crate::entities::LineItem,
            crate::entities::CustomerInfo,
            crate::gateway::CardSummary,
            crate::gateway::CardBrand,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_checkout_routes() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Checkout Payments API"));
        assert!(json.contains("/api/v1/transactions/complete-payment"));
        assert!(json.contains("/api/v1/gateway/webhook"));
        assert!(json.contains("ErrorResponse"));
    }
}
