//! Billing HTTP handlers
//!
//! The webhook endpoint is the hot path: Stripe retries on any non-2xx, so
//! signature failures map to 400 (no retry will ever succeed) while
//! processing failures map to 500 to request redelivery.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::Json;
use conjure_billing::CreditAuditEntry;
use conjure_shared::{Plan, PlanInterval};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Stripe webhook receiver.
///
/// The body must stay raw: signature verification hashes the exact bytes
/// Stripe sent, so any deserialize-reserialize step would break it.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    tracing::debug!(
        event_id = %event.id,
        event_type = %event.type_,
        "Webhook signature verified"
    );

    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: Plan,
    #[serde(default = "default_interval")]
    pub interval: PlanInterval,
}

fn default_interval() -> PlanInterval {
    PlanInterval::Monthly
}

/// Create a hosted checkout session for the authenticated user.
pub async fn checkout_url(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<conjure_billing::CheckoutResponse>, ApiError> {
    let response = state
        .billing
        .checkout
        .subscription_checkout_url(user_id, req.plan, req.interval)
        .await?;

    Ok(Json(response))
}

/// Create a hosted billing-portal session for the authenticated user.
pub async fn portal_url(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<conjure_billing::PortalResponse>, ApiError> {
    let response = state.billing.portal.portal_url(user_id).await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

/// List the authenticated user's recent credit audit entries.
pub async fn credit_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CreditAuditEntry>>, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let entries = state.billing.credits.history(user_id, limit).await?;

    Ok(Json(entries))
}
