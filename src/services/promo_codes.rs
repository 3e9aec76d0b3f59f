use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::promo_code::{self, DiscountType, Entity as PromoCodeEntity};
use crate::errors::ServiceError;
use crate::services::pricing::round_money;

/// Immutable view of a promo code at the moment it was applied, stored on
/// the order. Later edits to the code must not retroactively alter
/// historical orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoSnapshot {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
}

/// A validated, priced promo application.
#[derive(Debug, Clone)]
pub struct PromoPricing {
    pub snapshot: PromoSnapshot,
    pub discount_amount: Decimal,
}

pub struct PromoCodeValidator;

impl PromoCodeValidator {
    /// Validates a promo code against a cart subtotal and prices the
    /// discount. Codes match case-insensitively.
    #[instrument(skip(conn), fields(code = %code))]
    pub async fn validate<C: ConnectionTrait>(
        conn: &C,
        code: &str,
        subtotal: Decimal,
        now: DateTime<Utc>,
    ) -> Result<PromoPricing, ServiceError> {
        let normalized = code.trim().to_uppercase();

        let promo = PromoCodeEntity::find()
            .filter(promo_code::Column::Code.eq(normalized.clone()))
            .filter(promo_code::Column::IsDeleted.eq(false))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Promo code '{}' not found", normalized)))?;

        Self::check_eligibility(&promo, subtotal, now)?;

        let discount_amount = Self::discount_for(&promo, subtotal);
        debug!(discount = %discount_amount, "Promo code priced");

        Ok(PromoPricing {
            snapshot: PromoSnapshot {
                id: promo.id,
                code: promo.code,
                discount_type: promo.discount_type,
                discount_value: promo.discount_value,
            },
            discount_amount,
        })
    }

    fn check_eligibility(
        promo: &promo_code::Model,
        subtotal: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if now < promo.starts_at || now >= promo.ends_at {
            return Err(ServiceError::Conflict(format!(
                "Promo code '{}' is not active",
                promo.code
            )));
        }

        if subtotal < promo.min_purchase_amount {
            return Err(ServiceError::Conflict(format!(
                "Promo code '{}' requires a minimum purchase of {}",
                promo.code, promo.min_purchase_amount
            )));
        }

        if let Some(limit) = promo.usage_limit {
            if promo.usage_count >= limit {
                return Err(ServiceError::Conflict(format!(
                    "Promo code '{}' has reached its usage limit",
                    promo.code
                )));
            }
        }

        Ok(())
    }

    /// Percentage discounts are capped by `max_discount_amount` when one is
    /// configured; every discount is clamped to the subtotal.
    fn discount_for(promo: &promo_code::Model, subtotal: Decimal) -> Decimal {
        let raw = match promo.discount_type {
            DiscountType::Percentage => {
                let raw = subtotal * promo.discount_value / Decimal::ONE_HUNDRED;
                match promo.max_discount_amount {
                    Some(cap) => raw.min(cap),
                    None => raw,
                }
            }
            DiscountType::Fixed => promo.discount_value,
        };

        round_money(raw.min(subtotal))
    }

    /// Consumes one use of the code: a single conditional
    /// check-and-increment so the usage-limit gate and the counter bump
    /// cannot be split by a concurrent redemption.
    #[instrument(skip(conn))]
    pub async fn redeem<C: ConnectionTrait>(conn: &C, promo_id: Uuid) -> Result<(), ServiceError> {
        let result = PromoCodeEntity::update_many()
            .col_expr(
                promo_code::Column::UsageCount,
                Expr::col(promo_code::Column::UsageCount).add(1),
            )
            .col_expr(promo_code::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(promo_code::Column::Id.eq(promo_id))
            .filter(promo_code::Column::IsDeleted.eq(false))
            .filter(
                Condition::any()
                    .add(promo_code::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(promo_code::Column::UsageCount)
                            .lt(Expr::col(promo_code::Column::UsageLimit)),
                    ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Promo code has reached its usage limit".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn promo(discount_type: DiscountType, value: Decimal) -> promo_code::Model {
        let now = Utc::now();
        promo_code::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".to_string(),
            discount_type,
            discount_value: value,
            max_discount_amount: None,
            min_purchase_amount: Decimal::ZERO,
            starts_at: now - chrono::Duration::days(1),
            ends_at: now + chrono::Duration::days(30),
            usage_limit: None,
            usage_count: 0,
            is_deleted: false,
            created_at: now,
            updated_at: None,
        }
    }

    #[test]
    fn percentage_discount_respects_cap() {
        let mut p = promo(DiscountType::Percentage, dec!(50));
        p.max_discount_amount = Some(dec!(100));

        // 50% of 1000 would be 500; the cap wins
        assert_eq!(
            PromoCodeValidator::discount_for(&p, dec!(1000)),
            dec!(100)
        );
    }

    #[test]
    fn percentage_discount_without_cap() {
        let p = promo(DiscountType::Percentage, dec!(10));
        assert_eq!(PromoCodeValidator::discount_for(&p, dec!(600)), dec!(60));
    }

    #[test]
    fn fixed_discount_is_clamped_to_subtotal() {
        let p = promo(DiscountType::Fixed, dec!(50));
        assert_eq!(PromoCodeValidator::discount_for(&p, dec!(600)), dec!(50));
        assert_eq!(PromoCodeValidator::discount_for(&p, dec!(30)), dec!(30));
    }

    #[test]
    fn expired_window_is_rejected() {
        let mut p = promo(DiscountType::Fixed, dec!(50));
        p.ends_at = Utc::now() - chrono::Duration::hours(1);

        let err = PromoCodeValidator::check_eligibility(&p, dec!(600), Utc::now()).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn window_end_is_exclusive() {
        let p = promo(DiscountType::Fixed, dec!(50));
        assert!(PromoCodeValidator::check_eligibility(&p, dec!(600), p.ends_at).is_err());
        assert!(PromoCodeValidator::check_eligibility(&p, dec!(600), p.starts_at).is_ok());
    }

    #[test]
    fn minimum_purchase_gate() {
        let mut p = promo(DiscountType::Fixed, dec!(50));
        p.min_purchase_amount = dec!(100);

        assert!(PromoCodeValidator::check_eligibility(&p, dec!(99.99), Utc::now()).is_err());
        assert!(PromoCodeValidator::check_eligibility(&p, dec!(100), Utc::now()).is_ok());
    }

    #[test]
    fn exhausted_usage_limit_is_rejected() {
        let mut p = promo(DiscountType::Fixed, dec!(50));
        p.usage_limit = Some(5);
        p.usage_count = 5;

        let err = PromoCodeValidator::check_eligibility(&p, dec!(600), Utc::now()).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
