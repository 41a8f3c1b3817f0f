use crate::entities::{PaymentStatus, TransactionStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default capacity of the in-process event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Handle for publishing domain events. Cloning shares the channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes after a commit; a closed channel is logged, never surfaced.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Events emitted by the checkout flow once the corresponding write has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    TransactionCreated {
        transaction_id: Uuid,
        transaction_number: String,
    },
    PaymentCreated {
        payment_id: Uuid,
        transaction_id: Uuid,
    },
    PaymentReconciled {
        payment_id: Uuid,
        transaction_id: Uuid,
        payment_status: PaymentStatus,
        transaction_status: TransactionStatus,
    },
    /// An approved payment could not take stock for a line: inventory and
    /// payment state disagree and need manual follow-up.
    StockShortfall {
        transaction_id: Uuid,
        product_id: Uuid,
        requested: i32,
    },
}

/// Drains the event channel, logging each event. Runs until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::TransactionCreated {
                transaction_id,
                transaction_number,
            } => info!(%transaction_id, %transaction_number, "transaction created"),
            Event::PaymentCreated {
                payment_id,
                transaction_id,
            } => info!(%payment_id, %transaction_id, "payment created"),
            Event::PaymentReconciled {
                payment_id,
                transaction_id,
                payment_status,
                transaction_status,
            } => info!(
                %payment_id,
                %transaction_id,
                %payment_status,
                %transaction_status,
                "payment reconciled"
            ),
            Event::StockShortfall {
                transaction_id,
                product_id,
                requested,
            } => warn!(
                %transaction_id,
                %product_id,
                requested,
                "approved payment could not decrement stock"
            ),
        }
    }

    info!("Event processing loop stopped");
}
