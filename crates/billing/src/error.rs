//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook payload failed signature verification. Surfaces as 400 so
    /// Stripe does not retry a forged or corrupted delivery.
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Event payload did not contain the object the event type promises.
    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    /// No billing record matches the Stripe customer on the event.
    /// Client-class: the de-duplication marker is rolled back so a corrected
    /// redelivery can be retried.
    #[error("No user found for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("No billing record found for user {0}")]
    UserNotFound(uuid::Uuid),

    /// Fail-closed path: an unmapped credit-pack product must never grant
    /// credits (contrast with plan resolution, which fails open to FREE).
    #[error("Unknown credit pack product: {0}")]
    UnknownPackProduct(String),

    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i32, requested: i32 },

    #[error("Stripe API error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Whether this error is the caller's fault (HTTP 400 class) rather than
    /// an infrastructure failure (500 class, provider will redeliver).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid
                | BillingError::WebhookEventNotSupported(_)
                | BillingError::CustomerNotFound(_)
                | BillingError::UserNotFound(_)
                | BillingError::UnknownPackProduct(_)
                | BillingError::InsufficientCredits { .. }
        )
    }
}
