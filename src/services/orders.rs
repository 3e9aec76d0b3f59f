use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::entities::customer::Entity as CustomerEntity;
use crate::entities::order::{
    self, CancelActor, Entity as OrderEntity, OrderStatus, PaymentMethod, PaymentStatus,
};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::order_status_history::{self, Entity as OrderStatusHistoryEntity};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::entities::promo_code::DiscountType;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{InventoryLedger, ReservationLine};
use crate::services::lifecycle::{OrderLifecycle, PaymentContext, TransitionContext};
use crate::services::order_numbers::OrderNumberGenerator;
use crate::services::pricing::{PricingCalculator, PricingPolicy};
use crate::services::promo_codes::{PromoCodeValidator, PromoPricing};

/// Request/Response types for the order service

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    #[validate]
    pub items: Vec<OrderLineInput>,
    #[validate]
    pub shipping_address: ShippingAddressInput,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShippingAddressInput {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Phone is required"))]
    pub phone: String,
    #[validate(length(min = 1, message = "Address line is required"))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "State is required"))]
    pub state: String,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
    #[validate(length(min = 1, message = "Country is required"))]
    pub country: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub cancelled_by: CancelActor,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatePaymentStatusRequest {
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub weight_kg: Decimal,
    pub line_subtotal: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub subtotal: Decimal,
    pub shipping_charge: Decimal,
    pub tax_rate_percent: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub promo_code: Option<String>,
    pub promo_discount_type: Option<DiscountType>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub refund_pending: bool,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub items: Vec<OrderItemResponse>,
}

/// Slim row for listings; full line items come from `get_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub final_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderSummary>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: OrderStatus,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Orchestrates order placement and lifecycle operations.
///
/// Every mutation confirms its authoritative write before responding; cache
/// invalidation and event emission run after commit and never fail the
/// operation.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
    event_sender: Option<Arc<EventSender>>,
    pricing: PricingCalculator,
    lifecycle: OrderLifecycle,
    order_number_attempts: u32,
    cache_ttl: Option<Duration>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        event_sender: Option<Arc<EventSender>>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let policy = PricingPolicy::from_config(&config.pricing)?;

        Ok(Self {
            db,
            cache,
            event_sender,
            pricing: PricingCalculator::new(policy),
            lifecycle: OrderLifecycle::new(config.orders.delivery_estimate_days),
            order_number_attempts: config.orders.order_number_attempts,
            cache_ttl: config.cache.default_ttl_secs.map(Duration::from_secs),
        })
    }

    /// Places an order: snapshots the cart from the live catalog, prices it,
    /// and persists order, line items, seeded history, stock decrements and
    /// promo redemption in one transaction.
    ///
    /// A failure anywhere before commit leaves no persisted order and no
    /// stock mutation.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        if request.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }

        let db = &*self.db;
        let now = Utc::now();

        self.check_customer(db, request.customer_id).await?;
        let snapshots = self.snapshot_lines(db, &request.items).await?;

        let subtotal: Decimal = snapshots
            .iter()
            .map(|(p, qty)| p.price * Decimal::from(*qty))
            .sum();
        let total_weight_kg: Decimal = snapshots.iter().map(|(p, _)| p.weight_kg).sum();

        let promo = match request.promo_code.as_deref() {
            Some(code) => Some(PromoCodeValidator::validate(db, code, subtotal, now).await?),
            None => None,
        };
        let discount_amount = promo
            .as_ref()
            .map(|p| p.discount_amount)
            .unwrap_or(Decimal::ZERO);

        let shipping_charge = self.pricing.shipping_charge(subtotal, total_weight_kg);
        let tax_rate_percent = self.pricing.tax_rate_percent();
        let tax_amount = self.pricing.tax_amount(subtotal, tax_rate_percent);
        let final_amount =
            self.pricing
                .final_amount(subtotal, discount_amount, tax_amount, shipping_charge)?;

        let order_number =
            OrderNumberGenerator::next(db, now, self.order_number_attempts).await?;

        let txn = db.begin().await?;
        let result = Self::persist_order(
            &txn,
            &request,
            &snapshots,
            promo.as_ref(),
            PersistedTotals {
                subtotal,
                shipping_charge,
                tax_rate_percent,
                tax_amount,
                discount_amount,
                final_amount,
            },
            order_number,
            now,
        )
        .await;

        let (order_model, item_models) = match result {
            Ok(persisted) => persisted,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        txn.commit().await?;

        info!(
            order_id = %order_model.id,
            order_number = %order_model.order_number,
            final_amount = %order_model.final_amount,
            "Order created"
        );

        self.invalidate_order_caches(order_model.customer_id).await;
        self.emit(Event::OrderCreated(order_model.id)).await;
        if let Some(promo) = &promo {
            self.emit(Event::PromoCodeRedeemed {
                order_id: order_model.id,
                promo_code_id: promo.snapshot.id,
            })
            .await;
        }

        Ok(Self::to_response(order_model, item_models))
    }

    /// Retrieves an order with its line items.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let order = Self::load_live_order(db, order_id).await?;
        let items = Self::load_items(db, order_id).await?;
        Ok(Self::to_response(order, items))
    }

    /// Retrieves an order by its human-readable number.
    #[instrument(skip(self), fields(order_number = %order_number))]
    pub async fn get_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let order = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .filter(order::Column::IsDeleted.eq(false))
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", order_number))
            })?;

        let items = Self::load_items(db, order.id).await?;
        Ok(Self::to_response(order, items))
    }

    /// The order's append-only status trail, oldest first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<StatusHistoryEntry>, ServiceError> {
        let db = &*self.db;
        Self::load_live_order(db, order_id).await?;

        let rows = OrderStatusHistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| StatusHistoryEntry {
                status: row.status,
                note: row.note,
                created_at: row.created_at,
            })
            .collect())
    }

    /// Lists all live orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let db = &*self.db;
        let paginator = OrderEntity::find()
            .filter(order::Column::IsDeleted.eq(false))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderListResponse {
            orders: orders.into_iter().map(Self::to_summary).collect(),
            total,
            page,
            per_page,
        })
    }

    /// Lists one customer's live orders, newest first, read through the
    /// cache. Cache trouble is logged and the store answers instead.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn list_customer_orders(
        &self,
        customer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let cache_key = format!(
            "orders:customer:{}:page:{}:per:{}",
            customer_id, page, per_page
        );
        match self.cache.get(&cache_key).await {
            Ok(Some(cached)) => {
                if let Ok(listing) = serde_json::from_str::<OrderListResponse>(&cached) {
                    return Ok(listing);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, key = %cache_key, "Cache read failed"),
        }

        let db = &*self.db;
        let paginator = OrderEntity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .filter(order::Column::IsDeleted.eq(false))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let listing = OrderListResponse {
            orders: orders.into_iter().map(Self::to_summary).collect(),
            total,
            page,
            per_page,
        };

        match serde_json::to_string(&listing) {
            Ok(serialized) => {
                if let Err(e) = self.cache.set(&cache_key, &serialized, self.cache_ttl).await {
                    warn!(error = %e, key = %cache_key, "Cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize listing for cache"),
        }

        Ok(listing)
    }

    /// Admin status update through the lifecycle state machine.
    #[instrument(skip(self, request), fields(order_id = %order_id, target = %request.status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        request: UpdateOrderStatusRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await?;

        let order = match Self::load_live_order(&txn, order_id).await {
            Ok(order) => order,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        let old_status = order.status;

        let outcome = match self
            .lifecycle
            .transition(
                &txn,
                order,
                request.status,
                TransitionContext {
                    note: request.note,
                    tracking_number: request.tracking_number,
                    carrier: request.carrier,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        txn.commit().await?;

        self.after_status_change(&outcome.order, old_status, outcome.released_lines)
            .await;

        let items = Self::load_items(db, order_id).await?;
        Ok(Self::to_response(outcome.order, items))
    }

    /// Cancels an order on behalf of the buyer or an administrator. Restores
    /// reserved stock exactly once and records refund intent when the order
    /// was already paid.
    #[instrument(skip(self, request), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        request: CancelOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await?;

        let order = match Self::load_live_order(&txn, order_id).await {
            Ok(order) => order,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        let old_status = order.status;

        let outcome = match self
            .lifecycle
            .transition(
                &txn,
                order,
                OrderStatus::Cancelled,
                TransitionContext {
                    cancelled_by: Some(request.cancelled_by),
                    cancel_reason: request.reason,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        txn.commit().await?;

        self.after_status_change(&outcome.order, old_status, outcome.released_lines)
            .await;

        let items = Self::load_items(db, order_id).await?;
        Ok(Self::to_response(outcome.order, items))
    }

    /// Applies a payment-status change with its coupled order-status side
    /// effects (auto-advance on payment, auto-cancel with stock restore on
    /// failure, refund bookkeeping).
    #[instrument(skip(self, request), fields(order_id = %order_id, target = %request.payment_status))]
    pub async fn update_payment_status(
        &self,
        order_id: Uuid,
        request: UpdatePaymentStatusRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await?;

        let order = match Self::load_live_order(&txn, order_id).await {
            Ok(order) => order,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        let old_status = order.status;
        let old_payment_status = order.payment_status;

        let outcome = match self
            .lifecycle
            .apply_payment_status(
                &txn,
                order,
                request.payment_status,
                PaymentContext {
                    transaction_id: request.transaction_id,
                    amount: request.amount,
                    note: request.note,
                },
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(Self::rollback_or_escalate(txn, err).await),
        };
        txn.commit().await?;

        self.emit(Event::PaymentStatusChanged {
            order_id,
            old_status: old_payment_status,
            new_status: outcome.order.payment_status,
        })
        .await;
        self.after_status_change(&outcome.order, old_status, outcome.released_lines)
            .await;

        let items = Self::load_items(db, order_id).await?;
        Ok(Self::to_response(outcome.order, items))
    }

    /// Soft-deletes an order for audit retention. Orders still holding a
    /// stock reservation must be cancelled first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db;
        let order = Self::load_live_order(db, order_id).await?;

        if matches!(order.status, OrderStatus::Pending | OrderStatus::Processing) {
            return Err(ServiceError::Conflict(
                "An order holding a stock reservation cannot be deleted; cancel it first"
                    .to_string(),
            ));
        }

        let customer_id = order.customer_id;
        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.is_deleted = Set(true);
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);
        active.update(db).await?;

        info!("Order soft-deleted");
        self.invalidate_order_caches(customer_id).await;
        self.emit(Event::OrderDeleted(order_id)).await;

        Ok(())
    }

    // ---- internals ----

    async fn check_customer(
        &self,
        db: &DatabaseConnection,
        customer_id: Uuid,
    ) -> Result<(), ServiceError> {
        let customer = CustomerEntity::find_by_id(customer_id)
            .one(db)
            .await?
            .filter(|c| !c.is_deleted)
            .ok_or_else(|| ServiceError::NotFound("Customer not found".to_string()))?;

        if !customer.is_active || customer.is_blocked {
            return Err(ServiceError::Conflict(
                "Customer account is not allowed to place orders".to_string(),
            ));
        }

        Ok(())
    }

    /// Snapshots each cart line from the live catalog. Rejects with the full
    /// list of unavailable products so the caller can fix the cart in one
    /// pass.
    async fn snapshot_lines(
        &self,
        db: &DatabaseConnection,
        items: &[OrderLineInput],
    ) -> Result<Vec<(product::Model, i32)>, ServiceError> {
        let ids: Vec<Uuid> = items.iter().map(|l| l.product_id).collect();
        let products: HashMap<Uuid, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut out_of_stock = Vec::new();
        let mut snapshots = Vec::with_capacity(items.len());

        for line in items {
            let product = products
                .get(&line.product_id)
                .filter(|p| !p.is_deleted)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", line.product_id))
                })?;

            if product.is_blocked
                || (product.track_inventory && product.stock < line.quantity)
            {
                out_of_stock.push(product.name.clone());
                continue;
            }

            snapshots.push((product.clone(), line.quantity));
        }

        if !out_of_stock.is_empty() {
            return Err(ServiceError::InsufficientStock(out_of_stock));
        }

        Ok(snapshots)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_order(
        txn: &DatabaseTransaction,
        request: &CreateOrderRequest,
        snapshots: &[(product::Model, i32)],
        promo: Option<&PromoPricing>,
        totals: PersistedTotals,
        order_number: String,
        now: DateTime<Utc>,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let order_id = Uuid::new_v4();
        let address = &request.shipping_address;

        let order_active = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(request.customer_id),
            status: Set(OrderStatus::Pending),
            payment_method: Set(request.payment_method),
            payment_status: Set(PaymentStatus::Pending),
            subtotal: Set(totals.subtotal),
            shipping_charge: Set(totals.shipping_charge),
            tax_rate_percent: Set(totals.tax_rate_percent),
            tax_amount: Set(totals.tax_amount),
            discount_amount: Set(totals.discount_amount),
            final_amount: Set(totals.final_amount),
            promo_code_id: Set(promo.map(|p| p.snapshot.id)),
            promo_code: Set(promo.map(|p| p.snapshot.code.clone())),
            promo_discount_type: Set(promo.map(|p| p.snapshot.discount_type)),
            promo_discount_value: Set(promo.map(|p| p.snapshot.discount_value)),
            ship_to_name: Set(address.name.clone()),
            ship_to_phone: Set(address.phone.clone()),
            ship_to_line1: Set(address.line1.clone()),
            ship_to_line2: Set(address.line2.clone()),
            ship_to_city: Set(address.city.clone()),
            ship_to_state: Set(address.state.clone()),
            ship_to_postal_code: Set(address.postal_code.clone()),
            ship_to_country: Set(address.country.clone()),
            tracking_number: Set(None),
            carrier: Set(None),
            estimated_delivery: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            cancel_reason: Set(None),
            cancelled_by: Set(None),
            refund_pending: Set(false),
            refunded_at: Set(None),
            refund_amount: Set(None),
            refund_transaction_id: Set(None),
            is_deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };

        let order_model = order_active.insert(txn).await?;

        let mut item_models = Vec::with_capacity(snapshots.len());
        for (product, quantity) in snapshots {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                product_name: Set(product.name.clone()),
                unit_price: Set(product.price),
                quantity: Set(*quantity),
                weight_kg: Set(product.weight_kg),
                line_subtotal: Set(product.price * Decimal::from(*quantity)),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
            item_models.push(item);
        }

        // Seed the audit trail; every order carries at least this entry.
        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(OrderStatus::Pending),
            note: Set("Order placed".to_string()),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;

        let lines: Vec<ReservationLine> = snapshots
            .iter()
            .map(|(product, quantity)| ReservationLine {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: *quantity,
            })
            .collect();
        InventoryLedger::reserve(txn, &lines).await?;

        if let Some(promo) = promo {
            PromoCodeValidator::redeem(txn, promo.snapshot.id).await?;
        }

        Ok((order_model, item_models))
    }

    /// Rolls the transaction back and surfaces the original error. A failed
    /// rollback means already-applied stock decrements may survive an
    /// aborted order, which demands out-of-band reconciliation.
    async fn rollback_or_escalate(txn: DatabaseTransaction, err: ServiceError) -> ServiceError {
        match txn.rollback().await {
            Ok(()) => err,
            Err(rollback_err) => {
                error!(error = %rollback_err, "Rollback failed after aborted order operation");
                ServiceError::FatalError(format!(
                    "compensation failed: {} (original error: {})",
                    rollback_err, err
                ))
            }
        }
    }

    async fn load_live_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .filter(order::Column::IsDeleted.eq(false))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn load_items<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?)
    }

    /// Post-commit bookkeeping shared by every status-affecting operation.
    async fn after_status_change(
        &self,
        updated: &order::Model,
        old_status: OrderStatus,
        released_lines: usize,
    ) {
        self.invalidate_order_caches(updated.customer_id).await;

        if updated.status != old_status {
            self.emit(Event::OrderStatusChanged {
                order_id: updated.id,
                old_status,
                new_status: updated.status,
            })
            .await;

            if updated.status == OrderStatus::Cancelled {
                self.emit(Event::OrderCancelled(updated.id)).await;
            }
        }

        if released_lines > 0 {
            self.emit(Event::StockReleased {
                order_id: updated.id,
                line_count: released_lines,
            })
            .await;
        }
    }

    async fn invalidate_order_caches(&self, customer_id: Uuid) {
        for pattern in [
            format!("orders:customer:{}:*", customer_id),
            "orders:admin:*".to_string(),
        ] {
            if let Err(e) = self.cache.invalidate_pattern(&pattern).await {
                warn!(error = %e, pattern = %pattern, "Cache invalidation failed");
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send event");
            }
        }
    }

    fn to_response(model: order::Model, items: Vec<order_item::Model>) -> OrderResponse {
        OrderResponse {
            id: model.id,
            order_number: model.order_number,
            customer_id: model.customer_id,
            status: model.status,
            payment_status: model.payment_status,
            payment_method: model.payment_method,
            subtotal: model.subtotal,
            shipping_charge: model.shipping_charge,
            tax_rate_percent: model.tax_rate_percent,
            tax_amount: model.tax_amount,
            discount_amount: model.discount_amount,
            final_amount: model.final_amount,
            promo_code: model.promo_code,
            promo_discount_type: model.promo_discount_type,
            tracking_number: model.tracking_number,
            carrier: model.carrier,
            estimated_delivery: model.estimated_delivery,
            delivered_at: model.delivered_at,
            cancelled_at: model.cancelled_at,
            cancel_reason: model.cancel_reason,
            refund_pending: model.refund_pending,
            refunded_at: model.refunded_at,
            refund_amount: model.refund_amount,
            created_at: model.created_at,
            updated_at: model.updated_at,
            version: model.version,
            items: items
                .into_iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id,
                    product_name: item.product_name,
                    unit_price: item.unit_price,
                    quantity: item.quantity,
                    weight_kg: item.weight_kg,
                    line_subtotal: item.line_subtotal,
                })
                .collect(),
        }
    }

    fn to_summary(model: order::Model) -> OrderSummary {
        OrderSummary {
            id: model.id,
            order_number: model.order_number,
            customer_id: model.customer_id,
            status: model.status,
            payment_status: model.payment_status,
            final_amount: model.final_amount,
            created_at: model.created_at,
        }
    }
}

struct PersistedTotals {
    subtotal: Decimal,
    shipping_charge: Decimal,
    tax_rate_percent: Decimal,
    tax_amount: Decimal,
    discount_amount: Decimal,
    final_amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order(now: DateTime<Utc>) -> order::Model {
        order::Model {
            id: Uuid::new_v4(),
            order_number: "ORD-20260805-0042".to_string(),
            customer_id: Uuid::new_v4(),
            status: OrderStatus::Pending,
            payment_method: PaymentMethod::Card,
            payment_status: PaymentStatus::Pending,
            subtotal: dec!(600),
            shipping_charge: dec!(50),
            tax_rate_percent: dec!(10),
            tax_amount: dec!(60),
            discount_amount: dec!(0),
            final_amount: dec!(710),
            promo_code_id: None,
            promo_code: None,
            promo_discount_type: None,
            promo_discount_value: None,
            ship_to_name: "Asha Rao".to_string(),
            ship_to_phone: "9999999999".to_string(),
            ship_to_line1: "12 Hill Road".to_string(),
            ship_to_line2: None,
            ship_to_city: "Mumbai".to_string(),
            ship_to_state: "MH".to_string(),
            ship_to_postal_code: "400050".to_string(),
            ship_to_country: "IN".to_string(),
            tracking_number: None,
            carrier: None,
            estimated_delivery: None,
            delivered_at: None,
            cancelled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            refund_pending: false,
            refunded_at: None,
            refund_amount: None,
            refund_transaction_id: None,
            is_deleted: false,
            created_at: now,
            updated_at: Some(now),
            version: 1,
        }
    }

    #[test]
    fn to_response_maps_order_and_items() {
        let now = Utc::now();
        let model = sample_order(now);
        let order_id = model.id;

        let items = vec![order_item::Model {
            id: Uuid::new_v4(),
            order_id,
            product_id: Uuid::new_v4(),
            product_name: "Trail Pack".to_string(),
            unit_price: dec!(300),
            quantity: 2,
            weight_kg: dec!(3),
            line_subtotal: dec!(600),
            created_at: now,
        }];

        let response = OrderService::to_response(model, items);
        assert_eq!(response.order_number, "ORD-20260805-0042");
        assert_eq!(response.status, OrderStatus::Pending);
        assert_eq!(response.final_amount, dec!(710));
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].line_subtotal, dec!(600));
    }

    #[test]
    fn listing_round_trips_through_cache_serialization() {
        let now = Utc::now();
        let listing = OrderListResponse {
            orders: vec![OrderService::to_summary(sample_order(now))],
            total: 1,
            page: 1,
            per_page: 20,
        };

        let serialized = serde_json::to_string(&listing).unwrap();
        let decoded: OrderListResponse = serde_json::from_str(&serialized).unwrap();
        assert_eq!(decoded.orders.len(), 1);
        assert_eq!(decoded.orders[0].final_amount, dec!(710));
    }
}
