mod billing;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/billing/webhook", post(billing::stripe_webhook))
        .route("/billing/checkout-url", post(billing::checkout_url))
        .route("/billing/portal-url", get(billing::portal_url))
        .route("/billing/credits/history", get(billing::credit_history))
        .with_state(state)
}
