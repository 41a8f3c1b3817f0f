pub mod health;
pub mod transactions;
pub mod webhooks;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::gateway::PaymentGateway;
use crate::services::{CheckoutService, TransactionService};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub transactions: Arc<TransactionService>,
    pub checkout: Arc<CheckoutService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Self {
        let transactions = Arc::new(TransactionService::new(
            db_pool,
            Some(event_sender),
            config.default_tax_rate(),
            config.default_currency.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            transactions.clone(),
            gateway,
            config.default_currency.clone(),
            Decimal::from(config.usd_to_cop_rate),
        ));

        Self {
            transactions,
            checkout,
        }
    }
}
