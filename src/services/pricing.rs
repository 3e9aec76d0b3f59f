use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::config::PricingConfig;
use crate::errors::ServiceError;

/// Rounds a money amount to 2 decimal places, midpoint away from zero.
///
/// Rounding happens per component: discount and tax are each rounded when
/// computed, and the final amount is the sum of already-rounded parts,
/// rounded once more.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Deployment pricing policy, decimal-typed for arithmetic.
#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub free_shipping_threshold: Decimal,
    pub base_shipping_charge: Decimal,
    pub per_kg_surcharge: Decimal,
    pub included_weight_kg: Decimal,
    pub tax_rate_percent: Decimal,
}

impl PricingPolicy {
    pub fn from_config(cfg: &PricingConfig) -> Result<Self, ServiceError> {
        fn decimal(value: f64, name: &str) -> Result<Decimal, ServiceError> {
            Decimal::from_f64(value).ok_or_else(|| {
                ServiceError::ValidationError(format!("Invalid pricing value for {}: {}", name, value))
            })
        }

        Ok(Self {
            free_shipping_threshold: decimal(cfg.free_shipping_threshold, "free_shipping_threshold")?,
            base_shipping_charge: decimal(cfg.base_shipping_charge, "base_shipping_charge")?,
            per_kg_surcharge: decimal(cfg.per_kg_surcharge, "per_kg_surcharge")?,
            included_weight_kg: decimal(cfg.included_weight_kg, "included_weight_kg")?,
            tax_rate_percent: decimal(cfg.tax_rate_percent, "tax_rate_percent")?,
        })
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            free_shipping_threshold: dec!(1000),
            base_shipping_charge: dec!(50),
            per_kg_surcharge: dec!(10),
            included_weight_kg: dec!(5),
            tax_rate_percent: dec!(10),
        }
    }
}

/// Pure shipping/tax/total arithmetic. No I/O; same inputs always yield the
/// same outputs.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    policy: PricingPolicy,
}

impl PricingCalculator {
    pub fn new(policy: PricingPolicy) -> Self {
        Self { policy }
    }

    pub fn tax_rate_percent(&self) -> Decimal {
        self.policy.tax_rate_percent
    }

    /// Shipping charge for an order.
    ///
    /// Free at or above the free-shipping threshold; otherwise the base
    /// charge, plus a surcharge per whole kilogram above the included
    /// weight.
    pub fn shipping_charge(&self, subtotal: Decimal, total_weight_kg: Decimal) -> Decimal {
        if subtotal >= self.policy.free_shipping_threshold {
            return Decimal::ZERO;
        }

        if total_weight_kg > self.policy.included_weight_kg {
            let excess_kg = (total_weight_kg - self.policy.included_weight_kg).ceil();
            self.policy.base_shipping_charge + excess_kg * self.policy.per_kg_surcharge
        } else {
            self.policy.base_shipping_charge
        }
    }

    /// Tax on the subtotal at the given rate, rounded to 2 decimals.
    ///
    /// The rate is a parameter rather than policy state so a stored order
    /// can always be re-checked against the rate it was priced with.
    pub fn tax_amount(&self, subtotal: Decimal, rate_percent: Decimal) -> Decimal {
        round_money(subtotal * rate_percent / Decimal::ONE_HUNDRED)
    }

    /// Final amount: `subtotal - discount + tax + shipping`, rounded.
    ///
    /// A negative result means a discount exceeded the subtotal upstream;
    /// that is an invariant violation and is rejected, never clamped.
    pub fn final_amount(
        &self,
        subtotal: Decimal,
        discount: Decimal,
        tax: Decimal,
        shipping: Decimal,
    ) -> Result<Decimal, ServiceError> {
        let total = subtotal - discount + tax + shipping;
        if total < Decimal::ZERO {
            return Err(ServiceError::InternalError(format!(
                "Final amount would be negative ({}): discount {} exceeds subtotal {}",
                total, discount, subtotal
            )));
        }
        Ok(round_money(total))
    }
}

impl Default for PricingCalculator {
    fn default() -> Self {
        Self::new(PricingPolicy::default())
    }
}
