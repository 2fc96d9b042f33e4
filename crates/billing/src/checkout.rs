//! Hosted checkout session creation
//!
//! Thin pass-through to Stripe Checkout. The session metadata carries our
//! `user_id` and `checkout_type` so the webhook side can bind the customer id
//! and route image-pack purchases without guessing.

use std::collections::HashMap;

use conjure_shared::{Plan, PlanInterval};
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCustomer, Customer,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a subscription checkout session and return its hosted URL.
    pub async fn subscription_checkout_url(
        &self,
        user_id: Uuid,
        plan: Plan,
        interval: PlanInterval,
    ) -> BillingResult<CheckoutResponse> {
        let price_id = self.price_for(plan, interval)?;
        let customer_id = self.get_or_create_customer(user_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("checkout_type".to_string(), "subscription".to_string());

        let return_url = self.stripe.config().checkout_return_url.clone();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer_id);
        params.success_url = Some(&return_url);
        params.cancel_url = Some(&return_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Internal("Checkout session has no URL".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            interval = %interval,
            "Checkout session created"
        );

        Ok(CheckoutResponse { url })
    }

    fn price_for(&self, plan: Plan, interval: PlanInterval) -> BillingResult<&str> {
        let prices = &self.stripe.config().price_ids;
        match (plan, interval) {
            (Plan::Basic, PlanInterval::Monthly) => Ok(&prices.basic_monthly),
            (Plan::Basic, PlanInterval::Yearly) => Ok(&prices.basic_yearly),
            (Plan::Pro, PlanInterval::Monthly) => Ok(&prices.pro_monthly),
            (Plan::Pro, PlanInterval::Yearly) => Ok(&prices.pro_yearly),
            (Plan::Free | Plan::Trial, _) => Err(BillingError::Internal(format!(
                "No checkout price for plan {}",
                plan
            ))),
        }
    }

    /// Find the user's Stripe customer, creating and linking one if needed.
    async fn get_or_create_customer(&self, user_id: Uuid) -> BillingResult<stripe::CustomerId> {
        let subscriptions = SubscriptionService::new(self.pool.clone());
        let record = subscriptions.get_by_user(user_id).await?;

        if let Some(existing) = &record.stripe_customer_id {
            return existing
                .parse()
                .map_err(|_| BillingError::Internal(format!("Bad customer id: {}", existing)));
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let customer = Customer::create(
            self.stripe.inner(),
            CreateCustomer {
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await?;

        subscriptions
            .link_customer(user_id, customer.id.as_str())
            .await?;

        Ok(customer.id)
    }
}
