//! Stripe client construction and configuration
//!
//! The client is built once at process startup and passed into every service
//! that needs it. No module-level singletons: the dependency graph is visible
//! in `BillingService` construction.

use std::collections::HashMap;

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Stripe price ids used when creating checkout sessions.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic_monthly: String,
    pub basic_yearly: String,
    pub pro_monthly: String,
    pub pro_yearly: String,
}

/// Stripe configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Product id of the BASIC subscription.
    pub basic_product_id: String,
    /// Product id of the PRO subscription.
    pub pro_product_id: String,
    /// Image credit packs: product id -> credits granted per purchase.
    pub image_pack_credits: HashMap<String, i32>,
    pub price_ids: PriceIds,
    /// Where Stripe sends the user after checkout completes.
    pub checkout_return_url: String,
    /// Where the billing portal sends the user back to.
    pub portal_return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let basic_product_id = require_env("STRIPE_BASIC_PRODUCT_ID")?;
        let pro_product_id = require_env("STRIPE_PRO_PRODUCT_ID")?;

        // Packs are optional; a deployment without image packs simply never
        // resolves a pack product id.
        let mut image_pack_credits = HashMap::new();
        if let Ok(id) = std::env::var("STRIPE_IMAGE_PACK_100_PRODUCT_ID") {
            image_pack_credits.insert(id, 100);
        }
        if let Ok(id) = std::env::var("STRIPE_IMAGE_PACK_300_PRODUCT_ID") {
            image_pack_credits.insert(id, 300);
        }

        let price_ids = PriceIds {
            basic_monthly: require_env("STRIPE_BASIC_MONTHLY_PRICE_ID")?,
            basic_yearly: require_env("STRIPE_BASIC_YEARLY_PRICE_ID")?,
            pro_monthly: require_env("STRIPE_PRO_MONTHLY_PRICE_ID")?,
            pro_yearly: require_env("STRIPE_PRO_YEARLY_PRICE_ID")?,
        };

        let checkout_return_url = std::env::var("CHECKOUT_RETURN_URL")
            .unwrap_or_else(|_| "http://localhost:3000/account/billing".to_string());
        let portal_return_url = std::env::var("PORTAL_RETURN_URL")
            .unwrap_or_else(|_| "http://localhost:3000/account/billing".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            basic_product_id,
            pro_product_id,
            image_pack_credits,
            price_ids,
            checkout_return_url,
            portal_return_url,
        })
    }
}

fn require_env(key: &str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{} not set", key)))
}

/// Wrapper around the Stripe SDK client that carries our configuration.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
