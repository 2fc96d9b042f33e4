//! Notification fan-out
//!
//! Best-effort side channels fired after a billing state transition commits:
//! welcome email for new subscriptions, a chat-ops message for upgrades,
//! conversion telemetry, and a CRM attribute update. Failures here are logged
//! and never re-thrown; the billing state change is authoritative and already
//! committed.

use conjure_shared::Plan;
use uuid::Uuid;

use crate::client::StripeClient;

/// Channel configuration loaded from environment variables. Every channel is
/// optional: an unconfigured channel is skipped silently.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub resend_api_key: Option<String>,
    pub from_address: String,
    /// Incoming-webhook URL for the internal chat-ops channel.
    pub chat_webhook_url: Option<String>,
    /// Conversion telemetry collector endpoint.
    pub analytics_endpoint: Option<String>,
    pub crm_api_key: Option<String>,
    pub crm_list_id: Option<String>,
}

impl NotificationConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            from_address: std::env::var("BILLING_FROM_EMAIL")
                .unwrap_or_else(|_| "billing@conjure.app".to_string()),
            chat_webhook_url: std::env::var("CHAT_OPS_WEBHOOK_URL").ok(),
            analytics_endpoint: std::env::var("ANALYTICS_ENDPOINT").ok(),
            crm_api_key: std::env::var("CRM_API_KEY").ok(),
            crm_list_id: std::env::var("CRM_LIST_ID").ok(),
        }
    }
}

#[derive(Clone)]
pub struct NotificationService {
    stripe: StripeClient,
    http: reqwest::Client,
    config: NotificationConfig,
}

impl NotificationService {
    pub fn new(stripe: StripeClient, config: NotificationConfig) -> Self {
        Self {
            stripe,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env(stripe: StripeClient) -> Self {
        Self::new(stripe, NotificationConfig::from_env())
    }

    /// Fan-out for a brand-new subscription: welcome email, conversion
    /// telemetry, CRM plan attribute.
    pub async fn subscription_started(&self, user_id: Uuid, customer_id: &str, plan: Plan) {
        let email = self.customer_email(customer_id).await;

        if let Some(email) = &email {
            if let Err(e) = self.send_welcome_email(email, plan).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to send welcome email");
            }
        } else {
            tracing::warn!(
                user_id = %user_id,
                customer_id = %customer_id,
                "No customer email available, skipping welcome email"
            );
        }

        if let Err(e) = self.track_conversion(user_id, plan).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to send conversion telemetry");
        }

        if let Some(email) = &email {
            if let Err(e) = self.update_crm_plan(email, plan).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to update CRM attributes");
            }
        }
    }

    /// Fan-out for an upgrade: internal chat-ops message only, no onboarding.
    pub async fn subscription_upgraded(&self, user_id: Uuid, from: Plan, to: Plan) {
        let text = format!("Subscription upgraded: user {} {} -> {}", user_id, from, to);
        if let Err(e) = self.post_chat_ops(&text).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to post chat-ops message");
        }
    }

    async fn customer_email(&self, customer_id: &str) -> Option<String> {
        let id: stripe::CustomerId = customer_id.parse().ok()?;
        match stripe::Customer::retrieve(self.stripe.inner(), &id, &[]).await {
            Ok(customer) => customer.email,
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to retrieve Stripe customer for email lookup"
                );
                None
            }
        }
    }

    async fn send_welcome_email(&self, to: &str, plan: Plan) -> Result<(), reqwest::Error> {
        let Some(api_key) = &self.config.resend_api_key else {
            tracing::debug!("Email channel not configured, skipping welcome email");
            return Ok(());
        };

        let body = serde_json::json!({
            "from": self.config.from_address,
            "to": [to],
            "subject": "Welcome to Conjure",
            "html": format!(
                "<p>Your {} subscription is active. Your image credits are ready \
                 for your next conjuration.</p>",
                plan
            ),
        });

        self.http
            .post("https://api.resend.com/emails")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn post_chat_ops(&self, text: &str) -> Result<(), reqwest::Error> {
        let Some(url) = &self.config.chat_webhook_url else {
            tracing::debug!("Chat-ops channel not configured, skipping message");
            return Ok(());
        };

        self.http
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn track_conversion(&self, user_id: Uuid, plan: Plan) -> Result<(), reqwest::Error> {
        let Some(endpoint) = &self.config.analytics_endpoint else {
            return Ok(());
        };

        self.http
            .post(endpoint)
            .json(&serde_json::json!({
                "event": "subscription_started",
                "user_id": user_id,
                "plan": plan,
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn update_crm_plan(&self, email: &str, plan: Plan) -> Result<(), reqwest::Error> {
        let (Some(api_key), Some(list_id)) = (&self.config.crm_api_key, &self.config.crm_list_id)
        else {
            return Ok(());
        };

        // Mailchimp-style merge-field update keyed by subscriber email.
        let url = format!(
            "https://us1.api.mailchimp.com/3.0/lists/{}/members/{}",
            list_id, email
        );

        self.http
            .put(&url)
            .basic_auth("anystring", Some(api_key))
            .json(&serde_json::json!({
                "email_address": email,
                "status_if_new": "subscribed",
                "merge_fields": { "PLAN": plan.as_str() },
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::{PriceIds, StripeConfig};

    fn test_stripe() -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: "sk_test_xxx".to_string(),
            webhook_secret: "whsec_test".to_string(),
            basic_product_id: "prod_basic".to_string(),
            pro_product_id: "prod_pro".to_string(),
            image_pack_credits: Default::default(),
            price_ids: PriceIds::default(),
            checkout_return_url: "http://localhost:3000".to_string(),
            portal_return_url: "http://localhost:3000".to_string(),
        })
    }

    #[tokio::test]
    async fn upgrade_posts_to_chat_webhook() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        let config = NotificationConfig {
            chat_webhook_url: Some(format!("{}/hook", server.url())),
            ..Default::default()
        };
        let service = NotificationService::new(test_stripe(), config);
        service
            .subscription_upgraded(Uuid::new_v4(), Plan::Basic, Plan::Pro)
            .await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn chat_webhook_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let config = NotificationConfig {
            chat_webhook_url: Some(format!("{}/hook", server.url())),
            ..Default::default()
        };
        let service = NotificationService::new(test_stripe(), config);
        // Must return normally; the caller's billing write already committed.
        service
            .subscription_upgraded(Uuid::new_v4(), Plan::Basic, Plan::Pro)
            .await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unconfigured_channels_are_skipped() {
        let service = NotificationService::new(test_stripe(), NotificationConfig::default());
        service
            .subscription_upgraded(Uuid::new_v4(), Plan::Basic, Plan::Pro)
            .await;
    }
}
