//! Stock checks and decrements against the product catalog.
//!
//! Validation is advisory: it runs before a transaction is created and
//! reserves nothing. The authoritative decrement happens only while a payment
//! is being reconciled to APPROVED, inside the reconciliation's database
//! transaction, as a conditional update that can never drive stock negative.

use metrics::counter;
use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{product, LineItem};
use crate::errors::ServiceError;

/// A line an approved payment could not take stock for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct StockShortfall {
    pub product_id: Uuid,
    pub requested: i32,
}

/// Checks each line against current stock, failing on the first line whose
/// product is missing or short. Reads only.
pub async fn validate_stock<C: ConnectionTrait>(
    conn: &C,
    items: &[LineItem],
) -> Result<(), ServiceError> {
    for item in items {
        let product = product::Entity::find_by_id(item.product_id)
            .one(conn)
            .await?
            .ok_or(ServiceError::ProductNotFound(item.product_id))?;

        if !product.has_stock_for(item.quantity) {
            counter!("checkout.stock.insufficient", 1);
            return Err(ServiceError::InsufficientStock {
                product: product.name,
                available: product.stock,
                requested: item.quantity,
            });
        }
    }
    Ok(())
}

/// Takes `quantity` units per line. Each line is a single
/// `stock = stock - q WHERE id = ? AND stock >= q` update, so concurrent
/// reconciliations cannot oversell. Lines that match no row are returned
/// instead of failing the reconciliation.
pub(crate) async fn decrement_stock<C: ConnectionTrait>(
    conn: &C,
    transaction_id: Uuid,
    items: &[LineItem],
) -> Result<Vec<StockShortfall>, ServiceError> {
    let mut shortfalls = Vec::new();

    for item in items {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(item.quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(item.product_id))
            .filter(product::Column::Stock.gte(item.quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(
                %transaction_id,
                product_id = %item.product_id,
                requested = item.quantity,
                "stock shortfall on approved payment"
            );
            counter!("checkout.stock.shortfall", 1);
            shortfalls.push(StockShortfall {
                product_id: item.product_id,
                requested: item.quantity,
            });
        } else {
            debug!(product_id = %item.product_id, quantity = item.quantity, "stock decremented");
        }
    }

    Ok(shortfalls)
}
