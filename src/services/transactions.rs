use chrono::Utc;
use metrics::counter;
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::stock::{self, StockShortfall};
use crate::{
    entities::{
        payment, transaction, CustomerInfo, LineItem, PaymentStatus, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{CardSummary, GatewayResponse},
};

const TRANSACTION_NUMBER_PREFIX: &str = "TXN";
const TRANSACTION_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const TRANSACTION_NUMBER_SUFFIX_LEN: usize = 6;
const MAX_NUMBER_ATTEMPTS: u32 = 3;

/// `TXN-<unix millis>-<6 uppercase alphanumerics>`
pub fn generate_transaction_number() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..TRANSACTION_NUMBER_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TRANSACTION_NUMBER_ALPHABET.len());
            TRANSACTION_NUMBER_ALPHABET[idx] as char
        })
        .collect();
    format!(
        "{}-{}-{}",
        TRANSACTION_NUMBER_PREFIX,
        Utc::now().timestamp_millis(),
        suffix
    )
}

/// `round(total * rate / 100, 2)`, halves away from zero.
pub fn compute_tax(total: Decimal, rate_percent: Decimal) -> Decimal {
    (total * rate_percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Input for [`TransactionService::create_transaction`].
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub line_items: Vec<LineItem>,
    pub customer_info: CustomerInfo,
    /// Pre-tax total
    pub total_amount: Decimal,
    /// Falls back to the configured default rate
    pub tax_rate: Option<Decimal>,
    /// Falls back to the configured default currency
    pub currency: Option<String>,
}

impl NewTransaction {
    fn check(&self) -> Result<(), ServiceError> {
        if self.line_items.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one line item is required".into(),
            ));
        }
        for item in &self.line_items {
            item.validate()?;
        }
        self.customer_info.validate()?;

        if self.total_amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Total amount must be greater than zero".into(),
            ));
        }
        if let Some(rate) = self.tax_rate {
            if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
                return Err(ServiceError::ValidationError(
                    "Tax rate must be between 0 and 100".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A transaction together with every payment attempt made against it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionWithPayments {
    pub transaction: transaction::Model,
    pub payments: Vec<payment::Model>,
}

/// Terminal result reported for a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    /// Stored verbatim when present; also the source of the gateway id
    pub gateway_response: Option<serde_json::Value>,
    pub card: Option<CardSummary>,
}

impl PaymentOutcome {
    pub fn new(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_response: None,
            card: None,
        }
    }

    pub fn with_gateway_response(mut self, response: serde_json::Value) -> Self {
        self.gateway_response = Some(response);
        self
    }

    pub fn with_card(mut self, card: CardSummary) -> Self {
        self.card = Some(card);
        self
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub payment: payment::Model,
    pub transaction_status: TransactionStatus,
    /// Lines an approval could not take stock for
    pub shortfalls: Vec<StockShortfall>,
    /// The payment was already in the requested state; nothing was written
    pub replayed: bool,
}

/// The transaction ledger. Sole writer of transaction and payment rows.
#[derive(Clone)]
pub struct TransactionService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
    default_tax_rate: Decimal,
    default_currency: String,
}

impl TransactionService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: Option<Arc<EventSender>>,
        default_tax_rate: Decimal,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            default_tax_rate,
            default_currency: default_currency.into(),
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            event_sender.send_or_log(event).await;
        }
    }

    /// Validates stock and persists a PENDING transaction with a fresh number.
    #[instrument(skip(self, request), fields(lines = request.line_items.len(), total = %request.total_amount))]
    pub async fn create_transaction(
        &self,
        request: NewTransaction,
    ) -> Result<transaction::Model, ServiceError> {
        request.check()?;

        let db = &*self.db_pool;
        stock::validate_stock(db, &request.line_items).await?;

        let tax_rate = request.tax_rate.unwrap_or(self.default_tax_rate);
        let tax_amount = compute_tax(request.total_amount, tax_rate);
        let currency = request
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.default_currency)
            .to_ascii_uppercase();
        let line_items = serde_json::to_value(&request.line_items)?;
        let customer_info = serde_json::to_value(&request.customer_info)?;

        let mut attempt = 0;
        let created = loop {
            attempt += 1;
            let now = Utc::now();
            let model = transaction::ActiveModel {
                id: Set(Uuid::new_v4()),
                transaction_number: Set(generate_transaction_number()),
                line_items: Set(line_items.clone()),
                customer_info: Set(customer_info.clone()),
                currency: Set(currency.clone()),
                total_amount: Set(request.total_amount),
                tax_rate: Set(tax_rate),
                tax_amount: Set(tax_amount),
                status: Set(TransactionStatus::Pending),
                created_at: Set(now),
                updated_at: Set(now),
            };

            match model.insert(db).await {
                Ok(created) => break created,
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    if attempt >= MAX_NUMBER_ATTEMPTS {
                        error!(attempt, "transaction numbers exhausted");
                        return Err(numbering_exhausted(e));
                    }
                    warn!(attempt, "transaction number collision, regenerating");
                }
                Err(e) => {
                    error!(error = %e, "Failed to create transaction");
                    return Err(e.into());
                }
            }
        };

        info!(
            transaction_id = %created.id,
            transaction_number = %created.transaction_number,
            %tax_amount,
            "Transaction created"
        );
        counter!("checkout.transactions.created", 1);
        self.publish(Event::TransactionCreated {
            transaction_id: created.id,
            transaction_number: created.transaction_number.clone(),
        })
        .await;

        Ok(created)
    }

    /// Lookup miss is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn find_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<TransactionWithPayments>, ServiceError> {
        let db = &*self.db_pool;
        match transaction::Entity::find_by_id(id).one(db).await? {
            Some(found) => Ok(Some(self.with_payments(found).await?)),
            None => Ok(None),
        }
    }

    /// Lookup miss is `Ok(None)`.
    #[instrument(skip(self))]
    pub async fn find_by_transaction_number(
        &self,
        transaction_number: &str,
    ) -> Result<Option<TransactionWithPayments>, ServiceError> {
        let db = &*self.db_pool;
        let found = transaction::Entity::find()
            .filter(transaction::Column::TransactionNumber.eq(transaction_number))
            .one(db)
            .await?;
        match found {
            Some(found) => Ok(Some(self.with_payments(found).await?)),
            None => Ok(None),
        }
    }

    async fn with_payments(
        &self,
        transaction: transaction::Model,
    ) -> Result<TransactionWithPayments, ServiceError> {
        let payments = payment::Entity::find()
            .filter(payment::Column::TransactionId.eq(transaction.id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;
        Ok(TransactionWithPayments {
            transaction,
            payments,
        })
    }

    /// Sets the status as given, with no transition check. Payment
    /// reconciliation is the normal way a transaction is finalized.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<transaction::Model, ServiceError> {
        let db = &*self.db_pool;
        let existing = transaction::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::TransactionNotFound(id.to_string()))?;

        let old_status = existing.status;
        let mut active: transaction::ActiveModel = existing.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(db).await?;

        info!(transaction_id = %id, %old_status, new_status = %status, "Transaction status updated");
        Ok(updated)
    }

    /// Opens a PENDING payment against a PENDING transaction.
    #[instrument(skip(self))]
    pub async fn create_payment(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
    ) -> Result<payment::Model, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be greater than zero".into(),
            ));
        }

        let db = &*self.db_pool;
        let owner = transaction::Entity::find_by_id(transaction_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::TransactionNotFound(transaction_id.to_string()))?;

        if owner.status != TransactionStatus::Pending {
            return Err(ServiceError::InvalidState(format!(
                "Transaction {} is {}; payments can only be created for PENDING transactions",
                owner.transaction_number, owner.status
            )));
        }

        let now = Utc::now();
        let created = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            transaction_id: Set(transaction_id),
            gateway_transaction_id: Set(None),
            amount: Set(amount),
            status: Set(PaymentStatus::Pending),
            gateway_response: Set(None),
            card_metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?;

        info!(payment_id = %created.id, %transaction_id, "Payment created");
        self.publish(Event::PaymentCreated {
            payment_id: created.id,
            transaction_id,
        })
        .await;

        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn find_payment(&self, payment_id: Uuid) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find_by_id(payment_id)
            .one(&*self.db_pool)
            .await?)
    }

    /// Manual or callback-driven status update; same effects as
    /// [`Self::reconcile_payment_outcome`].
    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        gateway_response: Option<serde_json::Value>,
    ) -> Result<Reconciliation, ServiceError> {
        let outcome = PaymentOutcome {
            status,
            gateway_response,
            card: None,
        };
        self.reconcile_payment_outcome(payment_id, outcome).await
    }

    /// Finalizes a payment and everything it implies, in one database
    /// transaction:
    ///
    /// 1. the payment leaves PENDING (conditional on still being PENDING),
    ///    storing the gateway response and the gateway id extracted from it;
    /// 2. the owning transaction becomes COMPLETED or FAILED, conditional on
    ///    still being PENDING;
    /// 3. on APPROVED, stock is taken for every line item.
    ///
    /// Stock is therefore taken at most once per transaction. If the owner is
    /// no longer PENDING the whole unit rolls back with
    /// [`ServiceError::InvalidState`] and the payment stays PENDING.
    ///
    /// Events are published after commit. Repeating the call with the
    /// outcome already stored is a no-op; asking for a different terminal
    /// outcome is [`ServiceError::InvalidState`].
    #[instrument(skip(self, outcome), fields(status = %outcome.status))]
    pub async fn reconcile_payment_outcome(
        &self,
        payment_id: Uuid,
        outcome: PaymentOutcome,
    ) -> Result<Reconciliation, ServiceError> {
        let target_status = outcome.status.transaction_outcome().ok_or_else(|| {
            ServiceError::ValidationError(
                "Payment status must be APPROVED, DECLINED or ERROR".into(),
            )
        })?;

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, %payment_id, "Failed to start reconciliation transaction");
            ServiceError::DatabaseError(e)
        })?;

        let current = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::PaymentNotFound(payment_id))?;

        if current.status.is_terminal() {
            let replay = replay(&txn, current, outcome.status).await;
            txn.rollback().await?;
            return replay;
        }

        let now = Utc::now();
        let mut update = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(outcome.status))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending));
        if let Some(response) = &outcome.gateway_response {
            if let Some(gateway_id) = GatewayResponse(response.clone()).gateway_id() {
                update = update.col_expr(
                    payment::Column::GatewayTransactionId,
                    Expr::value(gateway_id),
                );
            }
            update = update.col_expr(payment::Column::GatewayResponse, Expr::value(response.clone()));
        }
        if let Some(card) = &outcome.card {
            update = update.col_expr(
                payment::Column::CardMetadata,
                Expr::value(serde_json::to_value(card)?),
            );
        }

        if update.exec(&txn).await?.rows_affected == 0 {
            // Finalized concurrently between the read and the update.
            let latest = payment::Entity::find_by_id(payment_id)
                .one(&txn)
                .await?
                .ok_or(ServiceError::PaymentNotFound(payment_id))?;
            let replay = replay(&txn, latest, outcome.status).await;
            txn.rollback().await?;
            return replay;
        }

        let owner = transaction::Entity::find_by_id(current.transaction_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::TransactionNotFound(current.transaction_id.to_string()))?;

        if owner.status.is_terminal() {
            txn.rollback().await?;
            return Err(owner_not_pending(&owner, payment_id));
        }

        let finalized = transaction::Entity::update_many()
            .col_expr(transaction::Column::Status, Expr::value(target_status))
            .col_expr(transaction::Column::UpdatedAt, Expr::value(now))
            .filter(transaction::Column::Id.eq(owner.id))
            .filter(transaction::Column::Status.eq(TransactionStatus::Pending))
            .exec(&txn)
            .await?;
        if finalized.rows_affected != 1 {
            // Another payment finalized the owner between the read and the update.
            let latest = transaction::Entity::find_by_id(owner.id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::TransactionNotFound(owner.id.to_string()))?;
            txn.rollback().await?;
            return Err(owner_not_pending(&latest, payment_id));
        }
        let transaction_status = target_status;

        let shortfalls = if outcome.status == PaymentStatus::Approved {
            stock::decrement_stock(&txn, owner.id, &owner.line_items()?).await?
        } else {
            Vec::new()
        };

        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::PaymentNotFound(payment_id))?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %payment_id, "Failed to commit reconciliation");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            %payment_id,
            transaction_id = %owner.id,
            payment_status = %payment.status,
            %transaction_status,
            shortfalls = shortfalls.len(),
            "Payment reconciled"
        );
        counter!("checkout.payments.reconciled", 1, "status" => payment.status.to_string());

        self.publish(Event::PaymentReconciled {
            payment_id,
            transaction_id: owner.id,
            payment_status: payment.status,
            transaction_status,
        })
        .await;
        for shortfall in &shortfalls {
            self.publish(Event::StockShortfall {
                transaction_id: owner.id,
                product_id: shortfall.product_id,
                requested: shortfall.requested,
            })
            .await;
        }

        Ok(Reconciliation {
            payment,
            transaction_status,
            shortfalls,
            replayed: false,
        })
    }
}

fn numbering_exhausted(err: DbErr) -> ServiceError {
    ServiceError::Other(anyhow::Error::new(err).context(format!(
        "no unique transaction number after {} attempts",
        MAX_NUMBER_ATTEMPTS
    )))
}

fn owner_not_pending(owner: &transaction::Model, payment_id: Uuid) -> ServiceError {
    warn!(
        transaction_id = %owner.id,
        status = %owner.status,
        %payment_id,
        "payment outcome rejected; owning transaction is no longer pending"
    );
    ServiceError::InvalidState(format!(
        "Transaction {} is already {}; payment {} cannot be finalized",
        owner.transaction_number, owner.status, payment_id
    ))
}

async fn replay<C: ConnectionTrait>(
    conn: &C,
    payment: payment::Model,
    requested: PaymentStatus,
) -> Result<Reconciliation, ServiceError> {
    if payment.status != requested {
        return Err(ServiceError::InvalidState(format!(
            "Payment {} is already {} and cannot become {}",
            payment.id, payment.status, requested
        )));
    }

    let transaction_status = transaction::Entity::find_by_id(payment.transaction_id)
        .one(conn)
        .await?
        .map(|t| t.status)
        .ok_or_else(|| ServiceError::TransactionNotFound(payment.transaction_id.to_string()))?;

    info!(payment_id = %payment.id, status = %payment.status, "payment already finalized; nothing to do");
    Ok(Reconciliation {
        payment,
        transaction_status,
        shortfalls: Vec::new(),
        replayed: true,
    })
}
