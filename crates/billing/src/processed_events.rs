//! Webhook event de-duplication store
//!
//! Stripe delivers webhooks at-least-once, and redeliveries can overlap the
//! original attempt. A row in `processed_webhook_events` means "already
//! handled or currently being handled"; the unique constraint on
//! `stripe_event_id` is the sole concurrency guard. The insert happens before
//! processing; the row is deleted if the handler throws, so a redelivery is a
//! clean re-attempt rather than a silently-skipped duplicate.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Outcome of attempting to claim an event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// We inserted the marker and own processing of this event.
    New(Uuid),
    /// A marker already exists; the caller must short-circuit to success.
    Duplicate,
}

/// Claim/rollback surface of the de-duplication store.
///
/// The webhook pipeline runs against this trait so the claim-then-rollback
/// choreography can be exercised without a database.
pub trait DedupStore {
    fn record_if_new(
        &self,
        stripe_event_id: &str,
        payload: &serde_json::Value,
    ) -> impl std::future::Future<Output = BillingResult<EventClaim>> + Send;

    fn rollback(&self, record_id: Uuid) -> impl std::future::Future<Output = BillingResult<()>> + Send;
}

pub struct ProcessedEventStore {
    pool: PgPool,
}

impl ProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DedupStore for ProcessedEventStore {
    /// Atomically claim an event id for processing.
    ///
    /// `INSERT ... ON CONFLICT DO NOTHING RETURNING id` returns a row exactly
    /// when the insert won; two concurrent deliveries of the same event id
    /// cannot both observe `New`.
    async fn record_if_new(
        &self,
        stripe_event_id: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<EventClaim> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events (stripe_event_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(stripe_event_id)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some((id,)) => Ok(EventClaim::New(id)),
            None => Ok(EventClaim::Duplicate),
        }
    }

    /// Compensating rollback: delete the marker so a redelivered event is
    /// treated as new. Called only when the handler for this event failed.
    async fn rollback(&self, record_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Nothing to delete is unexpected but not fatal: the redelivery
            // will be treated as a duplicate and skipped.
            tracing::warn!(
                record_id = %record_id,
                "De-duplication rollback found no row to delete"
            );
        }

        Ok(())
    }
}
