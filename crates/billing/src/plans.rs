//! Plan and credit resolution
//!
//! Pure mappings from Stripe product/price identifiers to internal plans,
//! intervals, and credit-grant quantities. No I/O: the catalog is built once
//! from [`StripeConfig`](crate::client::StripeConfig) and queried in memory.

use std::collections::HashMap;

use conjure_shared::{Plan, PlanInterval};

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};

/// Monthly image-credit allotment per plan.
pub const BASIC_MONTHLY_CREDITS: i32 = 100;
pub const PRO_MONTHLY_CREDITS: i32 = 300;

/// Credits granted for a plan at a given interval.
///
/// A YEARLY subscription gets the full year's allotment up front at renewal.
pub fn credits_for_plan(plan: Plan, interval: PlanInterval) -> i32 {
    let monthly = match plan {
        Plan::Free | Plan::Trial => 0,
        Plan::Basic => BASIC_MONTHLY_CREDITS,
        Plan::Pro => PRO_MONTHLY_CREDITS,
    };
    match interval {
        PlanInterval::Monthly => monthly,
        PlanInterval::Yearly => monthly * 12,
    }
}

/// Billing interval from Stripe's recurring interval string ("month"/"year").
pub fn interval_for_stripe_interval(interval: &str) -> PlanInterval {
    match interval {
        "year" => PlanInterval::Yearly,
        _ => PlanInterval::Monthly,
    }
}

/// A normalized invoice line item. Sign convention follows Stripe proration:
/// a negative amount is the previous plan being reversed, a positive amount
/// is the plan being charged for.
#[derive(Debug, Clone)]
pub struct InvoiceLine {
    pub amount_cents: i64,
    pub product_id: Option<String>,
    pub interval: Option<PlanInterval>,
}

/// Current/previous plan pair extracted from an invoice's line items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanChange {
    pub new: Option<(Plan, PlanInterval)>,
    pub previous: Option<(Plan, PlanInterval)>,
}

/// Static product-id catalog resolved from configuration.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    products: HashMap<String, Plan>,
    image_packs: HashMap<String, i32>,
}

impl PlanCatalog {
    pub fn from_config(config: &StripeConfig) -> Self {
        let mut products = HashMap::new();
        products.insert(config.basic_product_id.clone(), Plan::Basic);
        products.insert(config.pro_product_id.clone(), Plan::Pro);
        Self {
            products,
            image_packs: config.image_pack_credits.clone(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut products = HashMap::new();
        products.insert("prod_basic".to_string(), Plan::Basic);
        products.insert("prod_pro".to_string(), Plan::Pro);
        let mut image_packs = HashMap::new();
        image_packs.insert("prod_pack_100".to_string(), 100);
        Self {
            products,
            image_packs,
        }
    }

    /// Plan for a subscription product id.
    ///
    /// Fails open to FREE: an unmapped product id must not grant elevated
    /// access, and erroring here would wedge webhook processing on a catalog
    /// mismatch.
    pub fn plan_for_product_id(&self, product_id: &str) -> Plan {
        match self.products.get(product_id) {
            Some(plan) => *plan,
            None => {
                tracing::warn!(
                    product_id = %product_id,
                    "Unrecognized subscription product id, resolving to FREE"
                );
                Plan::Free
            }
        }
    }

    /// Credits for an image-pack product id.
    ///
    /// Fails closed: granting credits for an unmapped pack could hand out an
    /// unbounded entitlement, so this path errors instead of defaulting.
    pub fn credits_for_image_pack_product_id(&self, product_id: &str) -> BillingResult<i32> {
        self.image_packs
            .get(product_id)
            .copied()
            .ok_or_else(|| BillingError::UnknownPackProduct(product_id.to_string()))
    }

    /// Extract the current and previous plan from an invoice's line items.
    ///
    /// Stripe prorations emit a negative line for the unused remainder of the
    /// old plan and a positive line for the new plan. A first invoice has no
    /// negative line and therefore no previous plan.
    pub fn plan_change_from_lines(&self, lines: &[InvoiceLine]) -> PlanChange {
        let mut change = PlanChange::default();

        for line in lines {
            let Some(product_id) = line.product_id.as_deref() else {
                continue;
            };
            let plan = self.plan_for_product_id(product_id);
            let interval = line.interval.unwrap_or(PlanInterval::Monthly);

            if line.amount_cents < 0 {
                change.previous = Some((plan, interval));
            } else {
                change.new = Some((plan, interval));
            }
        }

        change
    }
}

/// Net credit grant for an invoice payment: credits for the new plan minus
/// credits already granted for the plan being prorated away.
pub fn credit_delta(change: &PlanChange) -> i32 {
    let new = change
        .new
        .map(|(plan, interval)| credits_for_plan(plan, interval))
        .unwrap_or(0);
    let previous = change
        .previous
        .map(|(plan, interval)| credits_for_plan(plan, interval))
        .unwrap_or(0);
    new - previous
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn yearly_pro_grants_full_year_up_front() {
        assert_eq!(credits_for_plan(Plan::Pro, PlanInterval::Yearly), 3600);
        assert_eq!(credits_for_plan(Plan::Basic, PlanInterval::Yearly), 1200);
    }

    #[test]
    fn free_and_trial_grant_nothing() {
        assert_eq!(credits_for_plan(Plan::Free, PlanInterval::Monthly), 0);
        assert_eq!(credits_for_plan(Plan::Trial, PlanInterval::Yearly), 0);
    }

    #[test]
    fn unknown_product_resolves_to_free() {
        let catalog = PlanCatalog::for_tests();
        assert_eq!(catalog.plan_for_product_id("unknown-id"), Plan::Free);
    }

    #[test]
    fn unknown_pack_product_fails_closed() {
        let catalog = PlanCatalog::for_tests();
        let err = catalog
            .credits_for_image_pack_product_id("unknown-id")
            .unwrap_err();
        assert!(matches!(err, BillingError::UnknownPackProduct(_)));

        assert_eq!(
            catalog
                .credits_for_image_pack_product_id("prod_pack_100")
                .unwrap(),
            100
        );
    }

    #[test]
    fn negative_line_is_previous_plan() {
        let catalog = PlanCatalog::for_tests();
        let lines = vec![
            InvoiceLine {
                amount_cents: -700,
                product_id: Some("prod_basic".to_string()),
                interval: Some(PlanInterval::Monthly),
            },
            InvoiceLine {
                amount_cents: 2000,
                product_id: Some("prod_pro".to_string()),
                interval: Some(PlanInterval::Monthly),
            },
        ];
        let change = catalog.plan_change_from_lines(&lines);
        assert_eq!(change.previous, Some((Plan::Basic, PlanInterval::Monthly)));
        assert_eq!(change.new, Some((Plan::Pro, PlanInterval::Monthly)));
        assert_eq!(credit_delta(&change), 200);
    }

    #[test]
    fn first_invoice_has_no_previous_plan() {
        let catalog = PlanCatalog::for_tests();
        let lines = vec![InvoiceLine {
            amount_cents: 2000,
            product_id: Some("prod_pro".to_string()),
            interval: Some(PlanInterval::Yearly),
        }];
        let change = catalog.plan_change_from_lines(&lines);
        assert_eq!(change.previous, None);
        assert_eq!(credit_delta(&change), 3600);
    }

    #[test]
    fn lines_without_product_are_skipped() {
        let catalog = PlanCatalog::for_tests();
        let lines = vec![InvoiceLine {
            amount_cents: 500,
            product_id: None,
            interval: None,
        }];
        assert_eq!(catalog.plan_change_from_lines(&lines), PlanChange::default());
    }
}
