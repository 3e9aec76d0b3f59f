use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::order::{self, CancelActor, OrderStatus, PaymentStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::order_status_history;
use crate::errors::ServiceError;
use crate::services::inventory::{InventoryLedger, ReservationLine};

/// Caller-supplied context for an order-status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Overrides the generated history note when set.
    pub note: Option<String>,
    /// Required for `-> Shipped`.
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    /// Who asked for a cancellation; defaults to Admin.
    pub cancelled_by: Option<CancelActor>,
    pub cancel_reason: Option<String>,
}

/// Caller-supplied context for a payment-status change.
#[derive(Debug, Clone, Default)]
pub struct PaymentContext {
    /// Gateway transaction reference for refunds.
    pub transaction_id: Option<String>,
    /// Amount for partial refunds; full refunds use the order total.
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

/// Result of an accepted transition.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub order: order::Model,
    /// Lines whose stock went back to the catalog (cancellation paths).
    pub released_lines: usize,
}

/// The order/payment state machine.
///
/// Every mutation of `status` or `payment_status` funnels through here so
/// the side effects — history append, stock release, refund bookkeeping —
/// happen exactly once per transition. Callers supply the transaction;
/// nothing in this type commits.
#[derive(Debug, Clone)]
pub struct OrderLifecycle {
    delivery_estimate_days: i64,
}

impl OrderLifecycle {
    pub fn new(delivery_estimate_days: i64) -> Self {
        Self {
            delivery_estimate_days,
        }
    }

    /// Legal order-status edges.
    ///
    /// Happy path `Pending -> Processing -> Shipped -> Delivered`;
    /// cancellation from the two pre-shipment states; returns after
    /// shipment; refunds only after cancellation or return.
    pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (from, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Shipped)
                | (Processing, Cancelled)
                | (Shipped, Delivered)
                | (Shipped, Returned)
                | (Delivered, Returned)
                | (Cancelled, Refunded)
                | (Returned, Refunded)
        )
    }

    /// Legal payment-status edges.
    pub fn is_valid_payment_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (from, to),
            (Pending, Paid)
                | (Pending, Failed)
                | (Paid, Refunded)
                | (Paid, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
        )
    }

    /// Applies one order-status transition with its side effects, appending
    /// exactly one history entry.
    #[instrument(skip(self, conn, order, ctx), fields(order_id = %order.id, from = %order.status, to = %target))]
    pub async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        target: OrderStatus,
        ctx: TransitionContext,
    ) -> Result<TransitionOutcome, ServiceError> {
        if order.is_deleted {
            return Err(ServiceError::NotFound("Order not found".to_string()));
        }

        let from = order.status;
        if !Self::is_valid_transition(from, target) {
            return Err(ServiceError::Conflict(format!(
                "Cannot transition order from '{}' to '{}'",
                from, target
            )));
        }

        let now = Utc::now();
        let mut released_lines = 0usize;
        let mut note = ctx
            .note
            .clone()
            .unwrap_or_else(|| format!("Status changed from {} to {}", from, target));

        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(target);
        active.updated_at = Set(Some(now));
        active.version = Set(order.version + 1);

        match target {
            OrderStatus::Shipped => {
                let tracking = ctx
                    .tracking_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        ServiceError::ValidationError(
                            "A tracking number is required to mark an order shipped".to_string(),
                        )
                    })?;
                active.tracking_number = Set(Some(tracking.to_string()));
                active.carrier = Set(ctx.carrier.clone());
                active.estimated_delivery =
                    Set(Some(now + Duration::days(self.delivery_estimate_days)));
            }
            OrderStatus::Delivered => {
                active.delivered_at = Set(Some(now));
            }
            OrderStatus::Cancelled => {
                let actor = ctx.cancelled_by.unwrap_or(CancelActor::Admin);
                active.cancelled_at = Set(Some(now));
                active.cancelled_by = Set(Some(actor));
                active.cancel_reason = Set(ctx.cancel_reason.clone());

                // Cancellation is only reachable from Pending/Processing and
                // is never re-entered, so this release runs exactly once per
                // order.
                let lines = Self::reservation_lines(conn, order.id).await?;
                released_lines = InventoryLedger::release(conn, &lines).await?;

                if ctx.note.is_none() {
                    note = match &ctx.cancel_reason {
                        Some(reason) => format!("Order cancelled by {}: {}", actor, reason),
                        None => format!("Order cancelled by {}", actor),
                    };
                }

                if order.payment_status == PaymentStatus::Paid {
                    active.refund_pending = Set(true);
                    note.push_str("; refund pending");
                }
            }
            _ => {}
        }

        let updated = active.update(conn).await?;
        Self::append_history(conn, order.id, target, note).await?;

        info!(released_lines, "Order transitioned");
        Ok(TransitionOutcome {
            order: updated,
            released_lines,
        })
    }

    /// Applies a payment-status change and the order-status side effects
    /// coupled to it, as one auditable unit.
    #[instrument(skip(self, conn, order, ctx), fields(order_id = %order.id, from = %order.payment_status, to = %target))]
    pub async fn apply_payment_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        target: PaymentStatus,
        ctx: PaymentContext,
    ) -> Result<TransitionOutcome, ServiceError> {
        if order.is_deleted {
            return Err(ServiceError::NotFound("Order not found".to_string()));
        }

        let from = order.payment_status;
        if !Self::is_valid_payment_transition(from, target) {
            return Err(ServiceError::Conflict(format!(
                "Cannot transition payment from '{}' to '{}'",
                from, target
            )));
        }

        let now = Utc::now();

        match target {
            PaymentStatus::Paid if order.status == OrderStatus::Pending => {
                // Payment confirmation moves a pending order straight into
                // fulfillment; one combined history entry.
                let mut active: order::ActiveModel = order.clone().into();
                active.payment_status = Set(PaymentStatus::Paid);
                active.status = Set(OrderStatus::Processing);
                active.updated_at = Set(Some(now));
                active.version = Set(order.version + 1);

                let updated = active.update(conn).await?;
                Self::append_history(
                    conn,
                    order.id,
                    OrderStatus::Processing,
                    ctx.note
                        .unwrap_or_else(|| "Payment received".to_string()),
                )
                .await?;

                Ok(TransitionOutcome {
                    order: updated,
                    released_lines: 0,
                })
            }
            PaymentStatus::Failed if order.status == OrderStatus::Pending => {
                // A failed payment on a pending order mirrors a manual
                // cancellation, including the stock restore.
                let mut active: order::ActiveModel = order.clone().into();
                active.payment_status = Set(PaymentStatus::Failed);
                active.updated_at = Set(Some(now));
                active.version = Set(order.version + 1);
                let updated = active.update(conn).await?;

                self.transition(
                    conn,
                    updated,
                    OrderStatus::Cancelled,
                    TransitionContext {
                        note: Some("Payment failed; order cancelled".to_string()),
                        cancelled_by: Some(CancelActor::System),
                        cancel_reason: Some("payment failed".to_string()),
                        ..Default::default()
                    },
                )
                .await
            }
            PaymentStatus::Refunded => {
                if !matches!(
                    order.status,
                    OrderStatus::Cancelled | OrderStatus::Returned
                ) {
                    return Err(ServiceError::Conflict(
                        "A refund requires a cancelled or returned order".to_string(),
                    ));
                }

                let mut active: order::ActiveModel = order.clone().into();
                active.payment_status = Set(PaymentStatus::Refunded);
                active.refund_pending = Set(false);
                active.refunded_at = Set(Some(now));
                active.refund_amount = Set(Some(order.final_amount));
                active.refund_transaction_id = Set(ctx.transaction_id.clone());
                active.updated_at = Set(Some(now));
                active.version = Set(order.version + 1);

                let updated = active.update(conn).await?;
                Ok(TransitionOutcome {
                    order: updated,
                    released_lines: 0,
                })
            }
            PaymentStatus::PartiallyRefunded => {
                let amount = ctx.amount.ok_or_else(|| {
                    ServiceError::ValidationError(
                        "A partial refund requires an amount".to_string(),
                    )
                })?;
                if amount <= Decimal::ZERO || amount >= order.final_amount {
                    return Err(ServiceError::ValidationError(
                        "Partial refund amount must be positive and below the order total"
                            .to_string(),
                    ));
                }

                let mut active: order::ActiveModel = order.clone().into();
                active.payment_status = Set(PaymentStatus::PartiallyRefunded);
                active.refunded_at = Set(Some(now));
                active.refund_amount = Set(Some(amount));
                active.refund_transaction_id = Set(ctx.transaction_id.clone());
                active.updated_at = Set(Some(now));
                active.version = Set(order.version + 1);

                let updated = active.update(conn).await?;
                Ok(TransitionOutcome {
                    order: updated,
                    released_lines: 0,
                })
            }
            // Paid/Failed on an order already past Pending: record the
            // payment fact, leave fulfillment alone.
            _ => {
                let mut active: order::ActiveModel = order.clone().into();
                active.payment_status = Set(target);
                active.updated_at = Set(Some(now));
                active.version = Set(order.version + 1);

                let updated = active.update(conn).await?;
                Ok(TransitionOutcome {
                    order: updated,
                    released_lines: 0,
                })
            }
        }
    }

    async fn reservation_lines<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<ReservationLine>, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;

        Ok(items
            .into_iter()
            .map(|item| ReservationLine {
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
            })
            .collect())
    }

    async fn append_history<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        status: OrderStatus,
        note: String,
    ) -> Result<(), ServiceError> {
        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(status),
            note: Set(note),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    use OrderStatus::*;

    #[test_case(Pending, Processing => true)]
    #[test_case(Pending, Cancelled => true)]
    #[test_case(Pending, Shipped => false)]
    #[test_case(Pending, Delivered => false)]
    #[test_case(Processing, Shipped => true)]
    #[test_case(Processing, Cancelled => true)]
    #[test_case(Processing, Delivered => false)]
    #[test_case(Shipped, Delivered => true)]
    #[test_case(Shipped, Returned => true)]
    #[test_case(Shipped, Cancelled => false)]
    #[test_case(Delivered, Returned => true)]
    #[test_case(Delivered, Cancelled => false)]
    #[test_case(Delivered, Refunded => false)]
    #[test_case(Cancelled, Refunded => true)]
    #[test_case(Cancelled, Pending => false)]
    #[test_case(Returned, Refunded => true)]
    #[test_case(Refunded, Pending => false)]
    #[test_case(Pending, Pending => false)]
    fn order_transition_table(from: OrderStatus, to: OrderStatus) -> bool {
        OrderLifecycle::is_valid_transition(from, to)
    }

    use PaymentStatus as P;

    #[test_case(P::Pending, P::Paid => true)]
    #[test_case(P::Pending, P::Failed => true)]
    #[test_case(P::Pending, P::Refunded => false)]
    #[test_case(P::Paid, P::Refunded => true)]
    #[test_case(P::Paid, P::PartiallyRefunded => true)]
    #[test_case(P::Paid, P::Pending => false)]
    #[test_case(P::PartiallyRefunded, P::Refunded => true)]
    #[test_case(P::Failed, P::Paid => false)]
    #[test_case(P::Refunded, P::Paid => false)]
    fn payment_transition_table(from: PaymentStatus, to: PaymentStatus) -> bool {
        OrderLifecycle::is_valid_payment_transition(from, to)
    }
}
