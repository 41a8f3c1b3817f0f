pub mod payment;
pub mod product;
pub mod transaction;

pub use payment::PaymentStatus;
pub use transaction::{CustomerInfo, LineItem, TransactionStatus};
