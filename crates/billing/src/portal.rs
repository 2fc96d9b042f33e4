//! Stripe billing portal pass-through

use sqlx::PgPool;
use stripe::{BillingPortalSession, CreateBillingPortalSession};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

#[derive(Debug, Clone, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub struct PortalService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PortalService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a billing-portal session for the user's Stripe customer.
    ///
    /// Requires an existing customer linkage; a user who never checked out
    /// has nothing to manage in the portal.
    pub async fn portal_url(&self, user_id: Uuid) -> BillingResult<PortalResponse> {
        let record = SubscriptionService::new(self.pool.clone())
            .get_by_user(user_id)
            .await?;

        let customer_id: stripe::CustomerId = record
            .stripe_customer_id
            .as_deref()
            .ok_or_else(|| {
                BillingError::Internal(format!("User {} has no Stripe customer", user_id))
            })?
            .parse()
            .map_err(|_| BillingError::Internal("Bad stored customer id".to_string()))?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        let return_url = self.stripe.config().portal_return_url.clone();
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        Ok(PortalResponse { url: session.url })
    }
}
