use crate::{config::ShippingConfig, errors::ServiceError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::catalog_service::ResolvedLineItem;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ShippingMethod {
    Standard,
    /// `fast` is accepted for expedited; storefront clients still send it.
    #[strum(to_string = "expedited", serialize = "fast")]
    Expedited,
}

impl ShippingMethod {
    /// Parses the method named in a checkout request.
    pub fn from_request(raw: &str) -> Result<Self, ServiceError> {
        let raw = raw.trim();
        raw.parse::<Self>()
            .map_err(|_| ServiceError::InvalidShippingMethod(raw.to_ascii_lowercase()))
    }
}

/// Two-tier shipping policy. Expedited is a flat fee; standard is free once
/// the subtotal is strictly above the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub standard_fee: Decimal,
    pub free_threshold: Decimal,
    pub expedited_fee: Decimal,
}

impl From<&ShippingConfig> for ShippingPolicy {
    fn from(cfg: &ShippingConfig) -> Self {
        Self {
            standard_fee: cfg.standard_shipping_fee,
            free_threshold: cfg.free_shipping_threshold,
            expedited_fee: cfg.expedited_shipping_fee,
        }
    }
}

impl Default for ShippingPolicy {
    fn default() -> Self {
        Self::from(&ShippingConfig::default())
    }
}

impl ShippingPolicy {
    pub fn shipping_cost(&self, method: ShippingMethod, subtotal: Decimal) -> Decimal {
        match method {
            ShippingMethod::Expedited => self.expedited_fee,
            ShippingMethod::Standard if subtotal > self.free_threshold => Decimal::ZERO,
            ShippingMethod::Standard => self.standard_fee,
        }
    }
}

/// Amounts a cart settlement charges, all in major units with two decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub payable: Decimal,
}

pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Sum of frozen unit price times quantity.
pub fn subtotal(items: &[ResolvedLineItem]) -> Decimal {
    money(items.iter().map(ResolvedLineItem::line_total).sum())
}

/// Converts a major-unit amount to the gateway's integer minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::Validation(format!("Amount {} is out of range", amount)))
}

/// Combines the cart pieces into the payable amount, never below zero.
#[derive(Debug, Clone, Default)]
pub struct PricingService {
    policy: ShippingPolicy,
}

impl PricingService {
    pub fn new(policy: ShippingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ShippingPolicy {
        &self.policy
    }

    pub fn price(
        &self,
        items: &[ResolvedLineItem],
        method: ShippingMethod,
        discount: Decimal,
    ) -> PriceBreakdown {
        let subtotal = subtotal(items);
        let shipping = self.policy.shipping_cost(method, subtotal);
        breakdown(subtotal, shipping, discount)
    }
}

pub fn breakdown(subtotal: Decimal, shipping: Decimal, discount: Decimal) -> PriceBreakdown {
    let discount = money(discount.max(Decimal::ZERO));
    let payable = money((subtotal + shipping - discount).max(Decimal::ZERO));
    PriceBreakdown {
        subtotal: money(subtotal),
        shipping: money(shipping),
        discount,
        payable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn line(price: Decimal, quantity: i32) -> ResolvedLineItem {
        ResolvedLineItem {
            product_id: Uuid::new_v4(),
            variant_id: None,
            name: "kit".into(),
            quantity,
            unit_price: price,
            available_stock: 100,
        }
    }

    #[rstest]
    #[case(ShippingMethod::Standard, dec!(499.99), dec!(70))]
    #[case(ShippingMethod::Standard, dec!(500), dec!(70))]
    #[case(ShippingMethod::Standard, dec!(500.01), dec!(0))]
    #[case(ShippingMethod::Standard, dec!(600), dec!(0))]
    #[case(ShippingMethod::Expedited, dec!(100), dec!(150))]
    #[case(ShippingMethod::Expedited, dec!(5000), dec!(150))]
    fn shipping_policy_tiers(
        #[case] method: ShippingMethod,
        #[case] subtotal: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(ShippingPolicy::default().shipping_cost(method, subtotal), expected);
    }

    #[rstest]
    #[case("standard", ShippingMethod::Standard)]
    #[case(" Expedited ", ShippingMethod::Expedited)]
    #[case("fast", ShippingMethod::Expedited)]
    #[case("FAST", ShippingMethod::Expedited)]
    fn shipping_method_parses_known_names(#[case] raw: &str, #[case] expected: ShippingMethod) {
        assert_eq!(ShippingMethod::from_request(raw).unwrap(), expected);
    }

    #[test]
    fn stored_names_are_canonical() {
        assert_eq!(ShippingMethod::Expedited.to_string(), "expedited");
        assert_eq!(ShippingMethod::Standard.as_ref(), "standard");
    }

    #[test]
    fn unknown_shipping_method_is_rejected() {
        assert_matches!(
            ShippingMethod::from_request("overnight"),
            Err(ServiceError::InvalidShippingMethod(m)) if m == "overnight"
        );
    }

    #[test]
    fn cart_of_600_ships_free_without_coupon() {
        let pricing = PricingService::default();
        let quote = pricing.price(
            &[line(dec!(200), 2), line(dec!(100), 2)],
            ShippingMethod::Standard,
            Decimal::ZERO,
        );
        assert_eq!(quote.subtotal, dec!(600));
        assert_eq!(quote.shipping, dec!(0));
        assert_eq!(quote.payable, dec!(600));
    }

    #[test]
    fn discount_larger_than_total_floors_at_zero() {
        let quote = breakdown(dec!(50), dec!(70), dec!(500));
        assert_eq!(quote.payable, Decimal::ZERO);
    }

    #[test]
    fn minor_units_are_paise() {
        assert_eq!(to_minor_units(dec!(600)).unwrap(), 60000);
        assert_eq!(to_minor_units(dec!(499.99)).unwrap(), 49999);
        assert_eq!(to_minor_units(dec!(0.005)).unwrap(), 1);
    }

    proptest! {
        #[test]
        fn payable_is_never_negative(
            subtotal_paise in 0i64..10_000_000,
            shipping_paise in 0i64..100_000,
            discount_paise in 0i64..20_000_000,
        ) {
            let quote = breakdown(
                Decimal::new(subtotal_paise, 2),
                Decimal::new(shipping_paise, 2),
                Decimal::new(discount_paise, 2),
            );
            prop_assert!(quote.payable >= Decimal::ZERO);
            if discount_paise <= subtotal_paise + shipping_paise {
                prop_assert_eq!(quote.payable, quote.subtotal + quote.shipping - quote.discount);
            }
        }
    }
}
