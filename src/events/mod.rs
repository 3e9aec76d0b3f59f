use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentStatus};

/// Events emitted by the order engine after a mutation commits.
///
/// Emission is fire-and-forget: a full or closed channel is logged by the
/// caller and never fails the business operation that produced the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    OrderDeleted(Uuid),
    PaymentStatusChanged {
        order_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
    StockReleased {
        order_id: Uuid,
        line_count: usize,
    },
    PromoCodeRedeemed {
        order_id: Uuid,
        promo_code_id: Uuid,
    },
}

#[derive(Debug, Clone)]
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
}

/// Builds a bounded event channel.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

/// Consumer loop draining the event channel.
///
/// Downstream fan-out (notifications, analytics) hangs off this loop in the
/// embedding application; here every event is logged for audit.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "Order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "Order status changed");
            }
            Event::OrderCancelled(order_id) => {
                info!(order_id = %order_id, "Order cancelled");
            }
            Event::OrderDeleted(order_id) => {
                info!(order_id = %order_id, "Order soft-deleted");
            }
            Event::PaymentStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "Payment status changed");
            }
            Event::StockReleased {
                order_id,
                line_count,
            } => {
                info!(order_id = %order_id, line_count = line_count, "Stock released back to catalog");
            }
            Event::PromoCodeRedeemed {
                order_id,
                promo_code_id,
            } => {
                info!(order_id = %order_id, promo_code_id = %promo_code_id, "Promo code redeemed");
            }
        }
    }

    info!("Event processing loop stopped");
}
