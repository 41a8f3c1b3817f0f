use crate::entities::{payment, transaction, CustomerInfo, LineItem, PaymentStatus, TransactionStatus};
use crate::errors::ServiceError;
use crate::gateway::CardData;
use crate::handlers::AppState;
use crate::services::{
    CheckoutResult, CompletePayment, NewTransaction, Reconciliation, StockShortfall,
    TransactionWithPayments,
};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

fn validate_tax_rate(value: &Decimal) -> Result<(), ValidationError> {
    if *value >= Decimal::ZERO && *value <= Decimal::ONE_HUNDRED {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Tax rate must be between 0 and 100".into());
        Err(err)
    }
}

fn validate_card_number(value: &str) -> Result<(), ValidationError> {
    let digits: Vec<char> = value.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    if (13..=19).contains(&digits.len()) && digits.iter().all(char::is_ascii_digit) {
        Ok(())
    } else {
        let mut err = ValidationError::new("card_number");
        err.message = Some("Card number must be 13 to 19 digits".into());
        Err(err)
    }
}

fn validate_cvc(value: &str) -> Result<(), ValidationError> {
    if (3..=4).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("cvc");
        err.message = Some("CVC must be 3 or 4 digits".into());
        Err(err)
    }
}

fn validate_expiry(value: &str) -> Result<(), ValidationError> {
    if parse_expiry(value).is_some() {
        Ok(())
    } else {
        let mut err = ValidationError::new("expiry");
        err.message = Some("Expiry must be in MM/YY format".into());
        Err(err)
    }
}

/// `MM/YY` into `("MM", "YY")`.
fn parse_expiry(value: &str) -> Option<(&str, &str)> {
    let (month, year) = value.trim().split_once('/')?;
    let valid_month = month.len() == 2
        && month.chars().all(|c| c.is_ascii_digit())
        && month
            .parse::<u8>()
            .map(|m| (1..=12).contains(&m))
            .unwrap_or(false);
    let valid_year = year.len() == 2 && year.chars().all(|c| c.is_ascii_digit());
    (valid_month && valid_year).then_some((month, year))
}

// Request DTOs

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "line_items": [
        { "product_id": "550e8400-e29b-41d4-a716-446655440000", "quantity": 2, "unit_price": "50000" }
    ],
    "customer_info": { "name": "Ana Gómez", "email": "ana@example.com", "phone": "+573001234567" },
    "total_amount": "100000",
    "tax_rate": "19",
    "currency": "COP"
}))]
pub struct CreateTransactionRequest {
    #[validate(length(min = 1, message = "At least one line item is required"))]
    pub line_items: Vec<LineItem>,
    #[validate]
    pub customer_info: CustomerInfo,
    /// Pre-tax total
    #[validate(custom = "validate_positive_decimal")]
    #[schema(value_type = String, example = "100000")]
    pub total_amount: Decimal,
    /// Percentage; defaults to the configured rate (19)
    #[validate(custom = "validate_tax_rate")]
    #[schema(value_type = Option<String>, example = "19")]
    pub tax_rate: Option<Decimal>,
    #[validate(length(equal = 3, message = "Currency must be 3 characters"))]
    #[schema(example = "COP")]
    pub currency: Option<String>,
}

impl From<CreateTransactionRequest> for NewTransaction {
    fn from(request: CreateTransactionRequest) -> Self {
        NewTransaction {
            line_items: request.line_items,
            customer_info: request.customer_info,
            total_amount: request.total_amount,
            tax_rate: request.tax_rate,
            currency: request.currency,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreatePaymentRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub transaction_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    #[schema(value_type = String, example = "100000")]
    pub amount: Decimal,
}

/// Raw card fields. Accepted for tokenization only; never stored or echoed.
#[derive(Deserialize, Validate, ToSchema)]
pub struct CreditCardInput {
    #[validate(custom = "validate_card_number")]
    #[schema(example = "4242424242424242")]
    pub number: String,
    #[validate(custom = "validate_expiry")]
    #[schema(example = "08/29")]
    pub expiry: String,
    #[validate(custom = "validate_cvc")]
    #[schema(example = "123")]
    pub cvc: String,
    #[validate(length(min = 1, max = 255, message = "Card holder name is required"))]
    #[schema(example = "Ana Gómez")]
    pub card_holder: String,
}

impl std::fmt::Debug for CreditCardInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditCardInput")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl TryFrom<CreditCardInput> for CardData {
    type Error = ServiceError;

    fn try_from(input: CreditCardInput) -> Result<Self, Self::Error> {
        let (month, year) = parse_expiry(&input.expiry).ok_or_else(|| {
            ServiceError::ValidationError("Expiry must be in MM/YY format".into())
        })?;
        Ok(CardData::new(
            &input.number,
            &input.cvc,
            month,
            year,
            &input.card_holder,
        ))
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "line_items": [
        { "product_id": "550e8400-e29b-41d4-a716-446655440000", "quantity": 2, "unit_price": "50000" }
    ],
    "customer_info": { "name": "Ana Gómez", "email": "ana@example.com" },
    "total_amount": "100000",
    "currency": "COP",
    "description": "Order from the online store",
    "credit_card": { "number": "4242424242424242", "expiry": "08/29", "cvc": "123", "card_holder": "Ana Gómez" }
}))]
pub struct CompletePaymentRequest {
    #[validate(length(min = 1, message = "At least one line item is required"))]
    pub line_items: Vec<LineItem>,
    #[validate]
    pub customer_info: CustomerInfo,
    #[validate(custom = "validate_positive_decimal")]
    #[schema(value_type = String, example = "100000")]
    pub total_amount: Decimal,
    #[validate(custom = "validate_tax_rate")]
    #[schema(value_type = Option<String>, example = "19")]
    pub tax_rate: Option<Decimal>,
    #[validate(length(equal = 3, message = "Currency must be 3 characters"))]
    #[schema(example = "COP")]
    pub currency: Option<String>,
    #[validate(length(max = 255))]
    pub description: Option<String>,
    #[validate]
    pub credit_card: CreditCardInput,
}

impl TryFrom<CompletePaymentRequest> for CompletePayment {
    type Error = ServiceError;

    fn try_from(request: CompletePaymentRequest) -> Result<Self, Self::Error> {
        Ok(CompletePayment {
            line_items: request.line_items,
            customer_info: request.customer_info,
            total_amount: request.total_amount,
            tax_rate: request.tax_rate,
            currency: request.currency,
            description: request.description,
            card: CardData::try_from(request.credit_card)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdatePaymentStatusRequest {
    /// APPROVED, DECLINED or ERROR
    pub status: PaymentStatus,
    /// Processor payload to store for audit
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub gateway_response: Option<Value>,
}

// Response views

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentView {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub gateway_transaction_id: Option<String>,
    #[schema(value_type = String, example = "100000")]
    pub amount: Decimal,
    pub status: PaymentStatus,
    #[schema(value_type = Option<Object>)]
    pub gateway_response: Option<Value>,
    /// Brand, last four, expiry and token only
    #[schema(value_type = Option<Object>)]
    pub card_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<payment::Model> for PaymentView {
    fn from(model: payment::Model) -> Self {
        Self {
            id: model.id,
            transaction_id: model.transaction_id,
            gateway_transaction_id: model.gateway_transaction_id,
            amount: model.amount,
            status: model.status,
            gateway_response: model.gateway_response,
            card_metadata: model.card_metadata,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionView {
    pub id: Uuid,
    #[schema(example = "TXN-1718000000000-AB12CD")]
    pub transaction_number: String,
    pub line_items: Vec<LineItem>,
    pub customer_info: CustomerInfo,
    #[schema(example = "COP")]
    pub currency: String,
    #[schema(value_type = String, example = "100000")]
    pub total_amount: Decimal,
    #[schema(value_type = String, example = "19")]
    pub tax_rate: Decimal,
    #[schema(value_type = String, example = "19000.00")]
    pub tax_amount: Decimal,
    pub status: TransactionStatus,
    pub payments: Vec<PaymentView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionView {
    fn build(model: transaction::Model, payments: Vec<payment::Model>) -> Result<Self, ServiceError> {
        Ok(Self {
            line_items: model.line_items()?,
            customer_info: model.customer_info()?,
            id: model.id,
            transaction_number: model.transaction_number,
            currency: model.currency,
            total_amount: model.total_amount,
            tax_rate: model.tax_rate,
            tax_amount: model.tax_amount,
            status: model.status,
            payments: payments.into_iter().map(PaymentView::from).collect(),
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

impl TryFrom<TransactionWithPayments> for TransactionView {
    type Error = ServiceError;

    fn try_from(found: TransactionWithPayments) -> Result<Self, Self::Error> {
        TransactionView::build(found.transaction, found.payments)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutView {
    pub transaction: TransactionView,
    pub payment: PaymentView,
    /// Processor response, or an error envelope when the attempt failed
    #[schema(value_type = Object)]
    pub gateway_response: Value,
}

impl TryFrom<CheckoutResult> for CheckoutView {
    type Error = ServiceError;

    fn try_from(result: CheckoutResult) -> Result<Self, Self::Error> {
        Ok(Self {
            transaction: TransactionView::build(result.transaction, vec![result.payment.clone()])?,
            payment: result.payment.into(),
            gateway_response: result.gateway_response,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReconciliationView {
    pub payment: PaymentView,
    pub transaction_status: TransactionStatus,
    pub stock_shortfalls: Vec<StockShortfall>,
    /// True when the payment already had this status and nothing changed
    pub replayed: bool,
}

impl From<Reconciliation> for ReconciliationView {
    fn from(reconciliation: Reconciliation) -> Self {
        Self {
            payment: reconciliation.payment.into(),
            transaction_status: reconciliation.transaction_status,
            stock_shortfalls: reconciliation.shortfalls,
            replayed: reconciliation.replayed,
        }
    }
}

// Handler functions

/// Create a PENDING transaction after checking stock
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = CreateTransactionRequest,
    responses(
        (status = 201, description = "Transaction created", body = crate::ApiResponse<TransactionView>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<TransactionView>>), ServiceError> {
    request.validate()?;

    let created = state
        .services
        .transactions
        .create_transaction(request.into())
        .await?;
    let view = TransactionView::build(created, Vec::new())?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

/// Get a transaction and its payments by id
#[utoipa::path(
    get,
    path = "/api/v1/transactions/{id}",
    params(
        ("id" = Uuid, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Transaction details", body = crate::ApiResponse<TransactionView>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<TransactionView>>, ServiceError> {
    let found = state
        .services
        .transactions
        .find_by_id(id)
        .await?
        .ok_or_else(|| ServiceError::TransactionNotFound(id.to_string()))?;
    Ok(Json(ApiResponse::success(found.try_into()?)))
}

/// Get a transaction and its payments by transaction number
#[utoipa::path(
    get,
    path = "/api/v1/transactions/number/{transaction_number}",
    params(
        ("transaction_number" = String, Path, description = "Transaction number, e.g. TXN-1718000000000-AB12CD")
    ),
    responses(
        (status = 200, description = "Transaction details", body = crate::ApiResponse<TransactionView>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn get_transaction_by_number(
    State(state): State<AppState>,
    Path(transaction_number): Path<String>,
) -> Result<Json<ApiResponse<TransactionView>>, ServiceError> {
    let found = state
        .services
        .transactions
        .find_by_transaction_number(&transaction_number)
        .await?
        .ok_or(ServiceError::TransactionNotFound(transaction_number))?;
    Ok(Json(ApiResponse::success(found.try_into()?)))
}

/// Open a PENDING payment against a PENDING transaction
#[utoipa::path(
    post,
    path = "/api/v1/transactions/payment",
    request_body = CreatePaymentRequest,
    responses(
        (status = 201, description = "Payment created", body = crate::ApiResponse<PaymentView>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Transaction not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Transaction is not PENDING", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentView>>), ServiceError> {
    request.validate()?;

    let created = state
        .services
        .transactions
        .create_payment(request.transaction_id, request.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created.into()))))
}

/// Run the whole checkout: transaction, payment, charge and reconciliation
#[utoipa::path(
    post,
    path = "/api/v1/transactions/complete-payment",
    request_body = CompletePaymentRequest,
    responses(
        (status = 201, description = "Checkout finished; inspect payment.status for the outcome", body = crate::ApiResponse<CheckoutView>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn complete_payment(
    State(state): State<AppState>,
    Json(request): Json<CompletePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutView>>), ServiceError> {
    request.validate()?;

    let result = state
        .services
        .checkout
        .complete_payment(request.try_into()?)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(result.try_into()?))))
}

/// Record a terminal payment outcome and reconcile stock and transaction
#[utoipa::path(
    post,
    path = "/api/v1/transactions/payment/{payment_id}/status",
    params(
        ("payment_id" = Uuid, Path, description = "Payment ID")
    ),
    request_body = UpdatePaymentStatusRequest,
    responses(
        (status = 200, description = "Payment reconciled", body = crate::ApiResponse<ReconciliationView>),
        (status = 400, description = "Invalid status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Payment already has a different terminal status", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<UpdatePaymentStatusRequest>,
) -> Result<Json<ApiResponse<ReconciliationView>>, ServiceError> {
    let reconciliation = state
        .services
        .transactions
        .update_payment_status(payment_id, request.status, request.gateway_response)
        .await?;
    Ok(Json(ApiResponse::success(reconciliation.into())))
}

/// Ask the processor for the current status of a payment's charge
#[utoipa::path(
    get,
    path = "/api/v1/transactions/payment/{payment_id}/gateway-status",
    params(
        ("payment_id" = Uuid, Path, description = "Payment ID")
    ),
    responses(
        (status = 200, description = "Processor response", body = crate::ApiResponse<serde_json::Value>),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Payment has no gateway transaction id", body = crate::errors::ErrorResponse),
        (status = 502, description = "Processor error", body = crate::errors::ErrorResponse)
    ),
    tag = "Transactions"
)]
pub async fn get_gateway_status(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, ServiceError> {
    let response = state.services.checkout.gateway_status(payment_id).await?;
    Ok(Json(ApiResponse::success(response.into_inner())))
}

pub fn transaction_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_transaction))
        .route("/number/:transaction_number", get(get_transaction_by_number))
        .route("/payment", post(create_payment))
        .route("/complete-payment", post(complete_payment))
        .route("/payment/:payment_id/status", post(update_payment_status))
        .route("/payment/:payment_id/gateway-status", get(get_gateway_status))
        .route("/:id", get(get_transaction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_split_into_month_and_year() {
        assert_eq!(parse_expiry("08/29"), Some(("08", "29")));
        assert_eq!(parse_expiry(" 12/30 "), Some(("12", "30")));
        assert_eq!(parse_expiry("13/29"), None);
        assert_eq!(parse_expiry("00/29"), None);
        assert_eq!(parse_expiry("8/29"), None);
        assert_eq!(parse_expiry("08-29"), None);
        assert_eq!(parse_expiry("+1/29"), None);
        assert_eq!(parse_expiry("08/+9"), None);
    }

    #[test]
    fn card_input_validation() {
        let card = CreditCardInput {
            number: "4242 4242 4242 4242".into(),
            expiry: "08/29".into(),
            cvc: "123".into(),
            card_holder: "Ana".into(),
        };
        assert!(card.validate().is_ok());

        let bad = CreditCardInput {
            number: "4242".into(),
            expiry: "8/29".into(),
            cvc: "12a".into(),
            card_holder: "".into(),
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("number"));
        assert!(fields.contains_key("expiry"));
        assert!(fields.contains_key("cvc"));
        assert!(fields.contains_key("card_holder"));
    }

    #[test]
    fn card_input_converts_without_separators() {
        let card = CardData::try_from(CreditCardInput {
            number: "4242-4242-4242-4242".into(),
            expiry: "08/29".into(),
            cvc: "123".into(),
            card_holder: "Ana".into(),
        })
        .unwrap();
        assert_eq!(card.number, "4242424242424242");
        assert_eq!(card.exp_month, "08");
        assert_eq!(card.exp_year, "29");
    }

    #[test]
    fn card_input_debug_hides_number_and_cvc() {
        let card = CreditCardInput {
            number: "4111111111111111".into(),
            expiry: "08/29".into(),
            cvc: "987".into(),
            card_holder: "Ana".into(),
        };
        let rendered = format!("{:?}", card);
        assert!(!rendered.contains("4111111111111111"));
        assert!(!rendered.contains("987"));
    }
}
