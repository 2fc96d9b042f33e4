//! Stripe webhook handling
//!
//! Verifies event signatures, claims each event id exactly once through the
//! de-duplication store, normalizes the provider payload into a closed
//! [`BillingWebhookEvent`] enum, and dispatches with an exhaustive match. A
//! handler failure rolls the de-duplication marker back and re-throws so
//! Stripe's redelivery retries the event from scratch.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use conjure_shared::{Plan, PlanInterval};

use crate::client::StripeClient;
use crate::credits::{CreditLedger, CreditType};
use crate::error::{BillingError, BillingResult};
use crate::notifications::NotificationService;
use crate::plans::{credit_delta, interval_for_stripe_interval, InvoiceLine, PlanCatalog};
use crate::processed_events::{DedupStore, EventClaim, ProcessedEventStore};
use crate::subscriptions::{should_grant_credits, SubscriptionService, TransitionKind};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance, matching Stripe's recommendation.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What a checkout session was for, carried in session metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutKind {
    Subscription,
    ImagePack,
}

/// Normalized view of a provider webhook payload.
///
/// This is a closed union: adding a provider event type means adding a
/// variant here and a match arm in the dispatcher, checked at compile time.
/// Types we deliberately do not handle normalize to `Unsupported`.
#[derive(Debug, Clone)]
pub enum BillingWebhookEvent {
    CheckoutCompleted {
        user_id: Option<Uuid>,
        customer_id: Option<String>,
        kind: CheckoutKind,
        pack_product_id: Option<String>,
    },
    SubscriptionUpdated {
        customer_id: String,
        active: bool,
        status: String,
        product_id: Option<String>,
        interval: PlanInterval,
        period_end: OffsetDateTime,
    },
    SubscriptionDeletedOrResumed {
        customer_id: String,
        period_end: OffsetDateTime,
    },
    SubscriptionPaused {
        customer_id: String,
    },
    InvoicePaid {
        customer_id: String,
        paid: bool,
        amount_paid_cents: i64,
        coupon_id: Option<String>,
        coupon_percent_off: Option<f64>,
        lines: Vec<InvoiceLine>,
        period_end: Option<OffsetDateTime>,
    },
    Unsupported {
        event_type: String,
    },
}

/// Webhook handler for Stripe events.
pub struct WebhookHandler {
    stripe: StripeClient,
    store: ProcessedEventStore,
    subscriptions: SubscriptionService,
    ledger: CreditLedger,
    catalog: PlanCatalog,
    notifications: NotificationService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, notifications: NotificationService) -> Self {
        let catalog = PlanCatalog::from_config(stripe.config());
        Self {
            stripe,
            store: ProcessedEventStore::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            ledger: CreditLedger::new(pool),
            catalog,
            notifications,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the SDK's verifier first, then falls back to manual t/v1 HMAC
    /// verification for API versions the SDK does not recognize.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "SDK webhook parsing failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;
        for part in signature.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                skew_secs = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Handle a verified Stripe event.
    ///
    /// The de-duplication marker is inserted before processing begins. On
    /// handler failure the marker is deleted and the error re-thrown so
    /// Stripe's redelivery is treated as a fresh attempt; on success the
    /// marker is retained permanently.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);

        process_with_dedup(&self.store, &event_id, &payload, || async {
            tracing::info!(
                event_id = %event_id,
                event_type = %event.type_,
                "Processing Stripe webhook event"
            );
            let normalized = normalize_event(&event)?;
            self.dispatch(normalized).await
        })
        .await
    }

    async fn dispatch(&self, event: BillingWebhookEvent) -> BillingResult<()> {
        match event {
            BillingWebhookEvent::CheckoutCompleted {
                user_id,
                customer_id,
                kind,
                pack_product_id,
            } => {
                self.handle_checkout_completed(user_id, customer_id, kind, pack_product_id)
                    .await
            }
            BillingWebhookEvent::SubscriptionUpdated {
                customer_id,
                active,
                status,
                product_id,
                interval,
                period_end,
            } => {
                self.handle_subscription_updated(
                    &customer_id,
                    active,
                    &status,
                    product_id.as_deref(),
                    interval,
                    period_end,
                )
                .await
            }
            BillingWebhookEvent::SubscriptionDeletedOrResumed {
                customer_id,
                period_end,
            } => {
                let record = self.subscriptions.get_by_customer(&customer_id).await?;
                self.subscriptions
                    .schedule_cancellation(&record, Some(period_end))
                    .await
            }
            BillingWebhookEvent::SubscriptionPaused { customer_id } => {
                let record = self.subscriptions.get_by_customer(&customer_id).await?;
                self.subscriptions.pause(&record).await
            }
            BillingWebhookEvent::InvoicePaid {
                customer_id,
                paid,
                amount_paid_cents,
                coupon_id,
                coupon_percent_off,
                lines,
                period_end,
            } => {
                self.handle_invoice_paid(
                    &customer_id,
                    paid,
                    amount_paid_cents,
                    coupon_id.as_deref(),
                    coupon_percent_off,
                    &lines,
                    period_end,
                )
                .await
            }
            BillingWebhookEvent::Unsupported { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    "Unhandled Stripe event type, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Checkout completed: first-time customer linkage for subscriptions,
    /// credit grant for image-pack purchases.
    async fn handle_checkout_completed(
        &self,
        user_id: Option<Uuid>,
        customer_id: Option<String>,
        kind: CheckoutKind,
        pack_product_id: Option<String>,
    ) -> BillingResult<()> {
        let Some(user_id) = user_id else {
            tracing::warn!("Checkout session without user_id metadata, ignoring");
            return Ok(());
        };

        if let Some(customer_id) = &customer_id {
            self.subscriptions
                .link_customer(user_id, customer_id)
                .await?;
        }

        match kind {
            CheckoutKind::Subscription => {
                // The subscription.updated event carries the plan change;
                // checkout completion only binds the customer id.
                Ok(())
            }
            CheckoutKind::ImagePack => {
                let product_id = pack_product_id.ok_or_else(|| {
                    BillingError::Internal(
                        "image pack checkout without pack_product_id metadata".to_string(),
                    )
                })?;
                // Fail-closed: an unmapped pack product aborts processing and
                // rolls back the marker instead of guessing a quantity.
                let credits = self
                    .catalog
                    .credits_for_image_pack_product_id(&product_id)?;
                self.ledger
                    .modify_credits(
                        user_id,
                        credits,
                        CreditType::Purchase,
                        &format!("Image pack purchase ({})", product_id),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn handle_subscription_updated(
        &self,
        customer_id: &str,
        active: bool,
        status: &str,
        product_id: Option<&str>,
        interval: PlanInterval,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        if !active {
            tracing::info!(
                customer_id = %customer_id,
                status = %status,
                "Subscription update with non-active status, ignoring"
            );
            return Ok(());
        }

        let record = self.subscriptions.get_by_customer(customer_id).await?;
        let new_plan = match product_id {
            Some(id) => self.catalog.plan_for_product_id(id),
            None => Plan::Free,
        };

        let outcome = self
            .subscriptions
            .apply_subscription_update(&record, new_plan, interval, Some(period_end))
            .await?;

        // Fan-out only after the transition committed; failures there never
        // affect the billing write.
        match outcome.kind {
            TransitionKind::NewSubscription => {
                self.notifications
                    .subscription_started(record.user_id, customer_id, outcome.effective_plan)
                    .await;
            }
            TransitionKind::Upgrade => {
                self.notifications
                    .subscription_upgraded(
                        record.user_id,
                        record.current_plan(),
                        outcome.effective_plan,
                    )
                    .await;
            }
            TransitionKind::DeferredDowngrade
            | TransitionKind::Unchanged
            | TransitionKind::Lateral => {}
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_invoice_paid(
        &self,
        customer_id: &str,
        paid: bool,
        amount_paid_cents: i64,
        coupon_id: Option<&str>,
        coupon_percent_off: Option<f64>,
        lines: &[InvoiceLine],
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        if !paid {
            tracing::info!(
                customer_id = %customer_id,
                "Invoice event with non-paid status, ignoring"
            );
            return Ok(());
        }

        let record = self.subscriptions.get_by_customer(customer_id).await?;

        // A paid renewal invoice marks the start of a new billing period:
        // the point where a scheduled downgrade takes effect.
        if let Some(plan) = self
            .subscriptions
            .apply_pending_plan_change(record.user_id)
            .await?
        {
            tracing::info!(
                user_id = %record.user_id,
                plan = %plan,
                "Applied scheduled downgrade at billing period renewal"
            );
        }

        let change = self.catalog.plan_change_from_lines(lines);

        // Preorder redemption: the invoice discount matches the stored
        // redemption coupon.
        let is_redemption = matches!(
            (coupon_id, record.preorder_coupon_id.as_deref()),
            (Some(a), Some(b)) if a == b
        );
        if is_redemption {
            let (plan, interval) = change
                .new
                .unwrap_or((record.current_plan(), record.current_interval()));
            self.subscriptions
                .redeem_preorder(&record, plan, interval, period_end)
                .await?;
            return Ok(());
        }

        // Regular recurring payment: net credit grant for the plan change,
        // gated on real payment or a 100%-off coupon.
        let delta = credit_delta(&change);
        if delta != 0 && should_grant_credits(amount_paid_cents, coupon_percent_off) {
            let comment = match change.new {
                Some((plan, interval)) => {
                    format!("Subscription payment ({} {})", plan, interval)
                }
                None => "Subscription payment".to_string(),
            };
            self.ledger
                .modify_credits(record.user_id, delta, CreditType::Subscription, &comment)
                .await?;
        }

        if let Some(period_end) = period_end {
            self.subscriptions
                .extend_paid_through(record.user_id, period_end)
                .await?;
        }

        Ok(())
    }
}

/// Run `process` under the de-duplication gate.
///
/// A duplicate claim short-circuits to success without invoking `process`. A
/// processing failure deletes the marker before the error propagates, so a
/// redelivered event is a fresh attempt, not a silently-skipped duplicate.
pub(crate) async fn process_with_dedup<S, F, Fut>(
    store: &S,
    event_id: &str,
    payload: &serde_json::Value,
    process: F,
) -> BillingResult<()>
where
    S: DedupStore,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = BillingResult<()>>,
{
    let record_id = match store.record_if_new(event_id, payload).await? {
        EventClaim::New(id) => id,
        EventClaim::Duplicate => {
            tracing::info!(event_id = %event_id, "Duplicate webhook event, skipping");
            return Ok(());
        }
    };

    let result = process().await;

    if let Err(e) = &result {
        tracing::warn!(
            event_id = %event_id,
            error = %e,
            "Event handler failed, rolling back de-duplication marker"
        );
        if let Err(rollback_err) = store.rollback(record_id).await {
            tracing::error!(
                event_id = %event_id,
                error = %rollback_err,
                "Failed to roll back de-duplication marker; redeliveries of \
                 this event will be skipped until the row is removed manually"
            );
        }
    }

    result
}

/// Normalize a Stripe event into the closed billing event union.
pub fn normalize_event(event: &Event) -> BillingResult<BillingWebhookEvent> {
    match event.type_ {
        EventType::CheckoutSessionCompleted => {
            let session = match &event.data.object {
                EventObject::CheckoutSession(session) => session,
                _ => {
                    return Err(BillingError::WebhookEventNotSupported(
                        "Expected CheckoutSession".to_string(),
                    ))
                }
            };

            let metadata = session.metadata.as_ref();
            let user_id = metadata
                .and_then(|m| m.get("user_id"))
                .and_then(|id| Uuid::parse_str(id).ok());
            let kind = match metadata
                .and_then(|m| m.get("checkout_type"))
                .map(String::as_str)
            {
                Some("image_pack") => CheckoutKind::ImagePack,
                _ => CheckoutKind::Subscription,
            };
            let pack_product_id = metadata.and_then(|m| m.get("pack_product_id")).cloned();
            let customer_id = session.customer.as_ref().map(expandable_customer_id);

            Ok(BillingWebhookEvent::CheckoutCompleted {
                user_id,
                customer_id,
                kind,
                pack_product_id,
            })
        }

        EventType::CustomerSubscriptionUpdated => {
            let subscription = extract_subscription(event)?;

            let price = subscription
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref());
            let product_id = price
                .and_then(|p| p.product.as_ref())
                .map(expandable_product_id);
            let interval = price
                .and_then(|p| p.recurring.as_ref())
                .map(|r| interval_for_stripe_interval(&r.interval.to_string()))
                .unwrap_or(PlanInterval::Monthly);

            Ok(BillingWebhookEvent::SubscriptionUpdated {
                customer_id: expandable_customer_id(&subscription.customer),
                active: subscription.status == stripe::SubscriptionStatus::Active,
                status: subscription.status.to_string(),
                product_id,
                interval,
                period_end: unix_timestamp(subscription.current_period_end),
            })
        }

        EventType::CustomerSubscriptionDeleted | EventType::CustomerSubscriptionResumed => {
            let subscription = extract_subscription(event)?;

            Ok(BillingWebhookEvent::SubscriptionDeletedOrResumed {
                customer_id: expandable_customer_id(&subscription.customer),
                period_end: unix_timestamp(subscription.current_period_end),
            })
        }

        EventType::CustomerSubscriptionPaused => {
            let subscription = extract_subscription(event)?;

            Ok(BillingWebhookEvent::SubscriptionPaused {
                customer_id: expandable_customer_id(&subscription.customer),
            })
        }

        EventType::InvoicePaid => {
            let invoice = match &event.data.object {
                EventObject::Invoice(invoice) => invoice,
                _ => {
                    return Err(BillingError::WebhookEventNotSupported(
                        "Expected Invoice".to_string(),
                    ))
                }
            };

            let customer_id = invoice
                .customer
                .as_ref()
                .map(expandable_customer_id)
                .ok_or_else(|| BillingError::Internal("No customer on invoice".to_string()))?;

            let coupon = invoice.discount.as_ref().map(|d| &d.coupon);
            let lines = invoice
                .lines
                .as_ref()
                .map(|lines| {
                    lines
                        .data
                        .iter()
                        .map(|line| {
                            let price = line.price.as_ref();
                            InvoiceLine {
                                amount_cents: line.amount,
                                product_id: price
                                    .and_then(|p| p.product.as_ref())
                                    .map(expandable_product_id),
                                interval: price.and_then(|p| p.recurring.as_ref()).map(|r| {
                                    interval_for_stripe_interval(&r.interval.to_string())
                                }),
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(BillingWebhookEvent::InvoicePaid {
                customer_id,
                paid: invoice.status == Some(stripe::InvoiceStatus::Paid),
                amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                coupon_id: coupon.map(|c| c.id.to_string()),
                coupon_percent_off: coupon.and_then(|c| c.percent_off),
                lines,
                period_end: invoice.period_end.map(unix_timestamp),
            })
        }

        _ => Ok(BillingWebhookEvent::Unsupported {
            event_type: event.type_.to_string(),
        }),
    }
}

fn extract_subscription(event: &Event) -> BillingResult<&stripe::Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

fn expandable_product_id(product: &stripe::Expandable<stripe::Product>) -> String {
    match product {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(p) => p.id.to_string(),
    }
}

fn unix_timestamp(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
