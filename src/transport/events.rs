use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::core::{Instrument, TradeSide};
use crate::execution::OrderId;

/// Order lifecycle notifications raised by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    OrderExecuted {
        order_id: OrderId,
        instrument: Instrument,
        side: TradeSide,
        trigger_reason: String,
        amount: f64,
        executed_price: f64,
        tx_ref: String,
        timestamp: DateTime<Utc>,
    },
    OrderFailed {
        order_id: OrderId,
        instrument: Instrument,
        trigger_reason: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrderEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::OrderExecuted { order_id, .. } | OrderEvent::OrderFailed { order_id, .. } => *order_id,
        }
    }
}

/// Fire-and-forget sink for order events. Implementations must never fail the caller.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: OrderEvent);
}

/// Broadcast-channel publisher; events with no subscribers are dropped
#[derive(Debug, Clone)]
pub struct OrderEventBus {
    tx: broadcast::Sender<OrderEvent>,
}

impl OrderEventBus {
    #[instrument]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        debug!("OrderEventBus initialized with capacity: {}", capacity);
        Self { tx }
    }

    #[instrument(skip(self))]
    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        let receiver = self.tx.subscribe();
        debug!("New subscriber added to order event bus");
        receiver
    }
}

impl Default for OrderEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventPublisher for OrderEventBus {
    fn publish(&self, event: OrderEvent) {
        let order_id = event.order_id();
        match self.tx.send(event) {
            Ok(subscriber_count) => info!(
                order_id = %order_id,
                subscriber_count = subscriber_count,
                "Published order event"
            ),
            Err(_) => warn!(
                order_id = %order_id,
                "Order event dropped: no subscribers"
            ),
        }
    }
}
