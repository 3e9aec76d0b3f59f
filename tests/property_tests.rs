//! Property-based tests for the pricing engine.
//!
//! These verify the pure-arithmetic invariants across a wide input range:
//! determinism, non-negativity, and the persisted-total identity.

use proptest::prelude::*;
use rust_decimal::Decimal;

use storefront_api::services::pricing::{round_money, PricingCalculator};

fn money_strategy() -> impl Strategy<Value = Decimal> {
    // up to 1,000,000.00 in cents
    (0i64..100_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn weight_strategy() -> impl Strategy<Value = Decimal> {
    // up to 100 kg in grams
    (0i64..100_000).prop_map(|grams| Decimal::new(grams, 3))
}

proptest! {
    #[test]
    fn shipping_is_deterministic_and_non_negative(
        subtotal in money_strategy(),
        weight in weight_strategy(),
    ) {
        let calc = PricingCalculator::default();
        let first = calc.shipping_charge(subtotal, weight);
        let second = calc.shipping_charge(subtotal, weight);
        prop_assert_eq!(first, second);
        prop_assert!(first >= Decimal::ZERO);
    }

    #[test]
    fn orders_at_or_above_the_threshold_ship_free(
        extra in money_strategy(),
        weight in weight_strategy(),
    ) {
        let calc = PricingCalculator::default();
        let subtotal = Decimal::new(100_000, 2) + extra;
        prop_assert_eq!(calc.shipping_charge(subtotal, weight), Decimal::ZERO);
    }

    #[test]
    fn tax_is_pure(subtotal in money_strategy()) {
        let calc = PricingCalculator::default();
        let rate = calc.tax_rate_percent();
        prop_assert_eq!(calc.tax_amount(subtotal, rate), calc.tax_amount(subtotal, rate));
    }

    #[test]
    fn final_amount_matches_the_persisted_invariant(
        subtotal in money_strategy(),
        weight in weight_strategy(),
        discount_pct in 0u32..=100u32,
    ) {
        let calc = PricingCalculator::default();
        let discount = round_money(
            subtotal * Decimal::from(discount_pct) / Decimal::ONE_HUNDRED,
        );
        let tax = calc.tax_amount(subtotal, calc.tax_rate_percent());
        let shipping = calc.shipping_charge(subtotal, weight);

        let total = calc
            .final_amount(subtotal, discount, tax, shipping)
            .expect("discount never exceeds subtotal here");

        prop_assert_eq!(total, round_money(subtotal - discount + tax + shipping));
        prop_assert!(total >= Decimal::ZERO);
    }
}
