//! In-process event bus for saga transitions.
//!
//! Delivery is best effort: events are not persisted, a subscriber that
//! lags behind loses the overflow and a crash loses anything in flight.
//! Nothing that must eventually happen relies on an event alone.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A transaction was advanced to `FAILED`.
    TransactionFailed {
        transaction_id: Uuid,
        reason: Option<String>,
    },
    /// The provider settled a bill payment.
    PaymentSucceeded {
        transaction_id: Uuid,
        external_reference: String,
        data: Option<serde_json::Value>,
    },
    /// A bill payment ended in `FAILED` and must be compensated.
    PaymentFailed { transaction_id: Uuid, reason: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransactionFailed { .. } => "transaction.failed",
            Self::PaymentSucceeded { .. } => "payment.success",
            Self::PaymentFailed { .. } => "payment.failed",
        }
    }

    pub fn transaction_id(&self) -> Uuid {
        match self {
            Self::TransactionFailed { transaction_id, .. }
            | Self::PaymentSucceeded { transaction_id, .. }
            | Self::PaymentFailed { transaction_id, .. } => *transaction_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        let name = event.name();
        let transaction_id = event.transaction_id();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!(event = name, %transaction_id, receivers, "event published");
                receivers
            }
            Err(_) => {
                tracing::debug!(event = name, %transaction_id, "event published with no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
