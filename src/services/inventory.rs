use std::collections::HashMap;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entities::product::{self, Entity as ProductEntity};
use crate::errors::ServiceError;

/// One line of a reservation, snapshotted from the catalog by the caller.
#[derive(Debug, Clone)]
pub struct ReservationLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
}

/// Stock ledger over the product catalog.
///
/// `reserve` and `release` run inside the caller's transaction; rollback is
/// what makes a multi-line reservation all-or-nothing. Neither direction is
/// idempotent — at-most-once per order per direction is the lifecycle's
/// responsibility.
pub struct InventoryLedger;

impl InventoryLedger {
    /// Names of products that cannot cover the requested quantities right
    /// now. Read-only; the authoritative check is the conditional update in
    /// `reserve`.
    pub async fn unavailable<C: ConnectionTrait>(
        conn: &C,
        lines: &[ReservationLine],
    ) -> Result<Vec<String>, ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let products: HashMap<Uuid, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut out_of_stock = Vec::new();
        for line in lines {
            match products.get(&line.product_id) {
                None => out_of_stock.push(line.product_name.clone()),
                Some(p) if p.is_deleted || p.is_blocked => out_of_stock.push(p.name.clone()),
                Some(p) if p.track_inventory && p.stock < line.quantity => {
                    out_of_stock.push(p.name.clone())
                }
                Some(_) => {}
            }
        }

        Ok(out_of_stock)
    }

    /// Decrements stock for every line, all-or-nothing.
    ///
    /// Each decrement is a single conditional update (`stock >= quantity`
    /// checked and applied in one statement), so two concurrent orders for
    /// the last unit cannot both succeed. The first line that cannot be
    /// covered aborts the whole call; the caller's transaction rollback
    /// discards decrements already applied.
    #[instrument(skip(conn, lines), fields(line_count = lines.len()))]
    pub async fn reserve<C: ConnectionTrait>(
        conn: &C,
        lines: &[ReservationLine],
    ) -> Result<(), ServiceError> {
        // Pre-pass so a rejection names every failing product, not just the
        // first. The conditional updates below remain the source of truth.
        let out_of_stock = Self::unavailable(conn, lines).await?;
        if !out_of_stock.is_empty() {
            return Err(ServiceError::InsufficientStock(out_of_stock));
        }

        let tracked = Self::tracked_product_ids(conn, lines).await?;

        for line in lines {
            if !tracked.contains(&line.product_id) {
                continue;
            }

            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(
                    product::Column::IsInStock,
                    // stock - quantity > 0, phrased against the pre-update value
                    Expr::col(product::Column::Stock).gt(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(line.product_id))
                .filter(product::Column::IsDeleted.eq(false))
                .filter(product::Column::IsBlocked.eq(false))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(conn)
                .await?;

            if result.rows_affected == 0 {
                // Lost the race since the pre-pass; rollback undoes the rest.
                warn!(product_id = %line.product_id, "Reservation lost a stock race");
                return Err(ServiceError::InsufficientStock(vec![line
                    .product_name
                    .clone()]));
            }
        }

        Ok(())
    }

    /// Exact inverse of `reserve`: restores stock for every line and marks
    /// the products in stock again.
    #[instrument(skip(conn, lines), fields(line_count = lines.len()))]
    pub async fn release<C: ConnectionTrait>(
        conn: &C,
        lines: &[ReservationLine],
    ) -> Result<usize, ServiceError> {
        let tracked = Self::tracked_product_ids(conn, lines).await?;

        let mut released = 0usize;
        for line in lines {
            if !tracked.contains(&line.product_id) {
                continue;
            }

            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(line.quantity),
                )
                .col_expr(product::Column::IsInStock, Expr::value(true))
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(line.product_id))
                .exec(conn)
                .await?;

            if result.rows_affected == 0 {
                // Release without a matching catalog row: reserved stock can
                // no longer be restored. Escalate for reconciliation.
                return Err(ServiceError::ConsistencyError(format!(
                    "Cannot release stock for missing product {}",
                    line.product_id
                )));
            }

            released += 1;
        }

        Ok(released)
    }

    /// Products in `lines` that actually gate on stock. Untracked products
    /// are never decremented or restored.
    async fn tracked_product_ids<C: ConnectionTrait>(
        conn: &C,
        lines: &[ReservationLine],
    ) -> Result<Vec<Uuid>, ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let tracked = ProductEntity::find()
            .filter(product::Column::Id.is_in(ids))
            .filter(product::Column::TrackInventory.eq(true))
            .all(conn)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        Ok(tracked)
    }
}
