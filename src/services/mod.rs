// Checkout orchestration
pub mod checkout;

// Ledger of transactions and payment attempts
pub mod transactions;

// Stock validation and reconciliation-time decrement
pub mod stock;

pub use checkout::{CheckoutResult, CheckoutService, CompletePayment};
pub use stock::{validate_stock, StockShortfall};
pub use transactions::{
    NewTransaction, PaymentOutcome, Reconciliation, TransactionService, TransactionWithPayments,
};
