// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe error payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Conjure Billing Module
//!
//! Handles Stripe integration for the content-generation product:
//! subscription lifecycle webhooks, the image-credit ledger, and hosted
//! checkout/portal pass-throughs.
//!
//! ## Features
//!
//! - **Webhook Processing**: idempotent, at-least-once-safe Stripe event
//!   handling with rollback-on-failure redelivery semantics
//! - **Subscription State Machine**: upgrades apply immediately, downgrades
//!   defer to the period end
//! - **Credit Ledger**: every image-credit mutation paired with an
//!   append-only audit row in one transaction
//! - **Plan Resolution**: product-id catalog, fail-open for plans and
//!   fail-closed for credit packs
//! - **Notification Fan-out**: best-effort email/chat-ops/analytics/CRM

pub mod checkout;
pub mod client;
pub mod credits;
pub mod error;
pub mod notifications;
pub mod plans;
pub mod portal;
pub mod processed_events;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Credits
pub use credits::{CreditAuditEntry, CreditLedger, CreditType};

// Error
pub use error::{BillingError, BillingResult};

// Notifications
pub use notifications::{NotificationConfig, NotificationService};

// Plans
pub use plans::{credit_delta, credits_for_plan, InvoiceLine, PlanCatalog, PlanChange};

// Portal
pub use portal::{PortalResponse, PortalService};

// Processed events
pub use processed_events::{DedupStore, EventClaim, ProcessedEventStore};

// Subscriptions
pub use subscriptions::{
    classify_transition, BillingRecord, SubscriptionService, SubscriptionUpdateOutcome,
    TransitionKind,
};

// Webhooks
pub use webhooks::{BillingWebhookEvent, CheckoutKind, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub credits: CreditLedger,
    pub notifications: NotificationService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let notifications = NotificationService::from_env(stripe.clone());
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            credits: CreditLedger::new(pool.clone()),
            notifications: notifications.clone(),
            portal: PortalService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, notifications),
        }
    }
}
