//! Subscription state machine
//!
//! Applies business rules for upgrade/downgrade/resume/pause transitions to a
//! user's billing record. The database is the source of truth; Stripe is for
//! payment processing only.
//!
//! Downgrades are never applied mid-cycle. A PRO user moving to BASIC or FREE
//! keeps PRO benefits until the current period ends: the intent is recorded
//! immediately in `pending_plan` / `pending_plan_effective_date`, and the
//! pending change is applied when the renewal invoice for the next period is
//! paid. This also guarantees credits are not granted twice for the same
//! billing interval.

use conjure_shared::{Plan, PlanInterval};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A user's billing record as stored in `user_billing`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingRecord {
    pub user_id: Uuid,
    pub plan: String,
    pub plan_interval: String,
    pub paid_through: Option<OffsetDateTime>,
    pub pending_plan: Option<String>,
    pub pending_plan_effective_date: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub stripe_customer_id: Option<String>,
    pub preorder_coupon_id: Option<String>,
    pub image_credits: i32,
}

impl BillingRecord {
    /// Plan currently in effect, honoring an elapsed scheduled change.
    ///
    /// A scheduled downgrade is persisted at the next renewal invoice, but
    /// after `customer.subscription.deleted` no further invoice arrives, so
    /// the stored `plan` column can stay stale indefinitely. Reading through
    /// the pending fields keeps transition classification correct: a canceled
    /// user who re-subscribes is a new subscription, not a change from the
    /// plan they no longer hold.
    pub fn current_plan(&self) -> Plan {
        if let (Some(pending), Some(effective)) = (
            self.pending_plan.as_deref(),
            self.pending_plan_effective_date,
        ) {
            if effective <= OffsetDateTime::now_utc() {
                return pending.parse().unwrap_or(Plan::Free);
            }
        }
        // An unparseable plan column is treated as FREE rather than wedging
        // webhook processing.
        self.plan.parse().unwrap_or(Plan::Free)
    }

    pub fn current_interval(&self) -> PlanInterval {
        self.plan_interval.parse().unwrap_or(PlanInterval::Monthly)
    }
}

/// How a `customer.subscription.updated` event affects the current plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Same plan; record the period but change nothing else.
    Unchanged,
    /// PRO moving down: record intent, keep PRO until period end.
    DeferredDowngrade,
    /// First paid plan for a FREE/TRIAL user; triggers onboarding.
    NewSubscription,
    /// BASIC to PRO; triggers the upgrade notification only.
    Upgrade,
    /// Any other immediate change (e.g. BASIC to FREE); applied silently.
    Lateral,
}

/// Classify a plan change. Pure so the deferral rules are testable without a
/// database.
pub fn classify_transition(current: Plan, new: Plan) -> TransitionKind {
    if new == current {
        TransitionKind::Unchanged
    } else if current == Plan::Pro && matches!(new, Plan::Basic | Plan::Free) {
        TransitionKind::DeferredDowngrade
    } else if !current.is_paid() && new.is_paid() {
        TransitionKind::NewSubscription
    } else if current == Plan::Basic && new == Plan::Pro {
        TransitionKind::Upgrade
    } else {
        TransitionKind::Lateral
    }
}

/// Whether an invoice payment entitles the user to a credit grant.
///
/// A $0 invoice from a 100%-off coupon still represents a real plan change
/// entitled to credits; any other $0 invoice does not.
pub fn should_grant_credits(amount_paid_cents: i64, coupon_percent_off: Option<f64>) -> bool {
    amount_paid_cents > 0 || coupon_percent_off == Some(100.0)
}

/// Result of applying a subscription update.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdateOutcome {
    pub kind: TransitionKind,
    /// Plan in effect after the update (unchanged for deferred downgrades).
    pub effective_plan: Plan,
    /// Pending plan recorded for a deferred downgrade.
    pub pending_plan: Option<Plan>,
}

pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up the billing record bound to a Stripe customer id.
    pub async fn get_by_customer(&self, customer_id: &str) -> BillingResult<BillingRecord> {
        let record: Option<BillingRecord> = sqlx::query_as(
            r#"
            SELECT user_id, plan, plan_interval, paid_through, pending_plan,
                   pending_plan_effective_date, trial_ends_at, stripe_customer_id,
                   preorder_coupon_id, image_credits
            FROM user_billing
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    pub async fn get_by_user(&self, user_id: Uuid) -> BillingResult<BillingRecord> {
        let record: Option<BillingRecord> = sqlx::query_as(
            r#"
            SELECT user_id, plan, plan_interval, paid_through, pending_plan,
                   pending_plan_effective_date, trial_ends_at, stripe_customer_id,
                   preorder_coupon_id, image_credits
            FROM user_billing
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or(BillingError::UserNotFound(user_id))
    }

    /// Bind a Stripe customer id to a user. First-time linkage only: an
    /// already-linked record is left alone.
    pub async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_billing
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE user_id = $1 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Customer linkage skipped (user missing or already linked)"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Stripe customer linked to user"
            );
        }

        Ok(())
    }

    /// Apply an active `customer.subscription.updated` event.
    pub async fn apply_subscription_update(
        &self,
        record: &BillingRecord,
        new_plan: Plan,
        interval: PlanInterval,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionUpdateOutcome> {
        let current = record.current_plan();
        let kind = classify_transition(current, new_plan);

        match kind {
            TransitionKind::DeferredDowngrade => {
                sqlx::query(
                    r#"
                    UPDATE user_billing
                    SET pending_plan = $2,
                        pending_plan_effective_date = $3,
                        updated_at = NOW()
                    WHERE user_id = $1
                    "#,
                )
                .bind(record.user_id)
                .bind(new_plan.as_str())
                .bind(period_end)
                .execute(&self.pool)
                .await?;

                tracing::info!(
                    user_id = %record.user_id,
                    from = %current,
                    to = %new_plan,
                    effective = ?period_end,
                    "Downgrade scheduled for period end"
                );

                Ok(SubscriptionUpdateOutcome {
                    kind,
                    effective_plan: current,
                    pending_plan: Some(new_plan),
                })
            }
            TransitionKind::Unchanged
            | TransitionKind::NewSubscription
            | TransitionKind::Upgrade
            | TransitionKind::Lateral => {
                // Immediate application clears any previously scheduled
                // downgrade and ends the trial.
                sqlx::query(
                    r#"
                    UPDATE user_billing
                    SET plan = $2,
                        plan_interval = $3,
                        paid_through = COALESCE($4, paid_through),
                        pending_plan = NULL,
                        pending_plan_effective_date = NULL,
                        trial_ends_at = NULL,
                        updated_at = NOW()
                    WHERE user_id = $1
                    "#,
                )
                .bind(record.user_id)
                .bind(new_plan.as_str())
                .bind(interval.as_str())
                .bind(period_end)
                .execute(&self.pool)
                .await?;

                tracing::info!(
                    user_id = %record.user_id,
                    from = %current,
                    to = %new_plan,
                    interval = %interval,
                    kind = ?kind,
                    "Plan applied"
                );

                Ok(SubscriptionUpdateOutcome {
                    kind,
                    effective_plan: new_plan,
                    pending_plan: None,
                })
            }
        }
    }

    /// Handle `customer.subscription.deleted` (and resume-after-cancel):
    /// schedule a downgrade to FREE at the period end rather than cutting the
    /// user off mid-period.
    pub async fn schedule_cancellation(
        &self,
        record: &BillingRecord,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_billing
            SET pending_plan = 'free',
                pending_plan_effective_date = $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(record.user_id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %record.user_id,
            effective = ?period_end,
            "Subscription ended, downgrade to FREE scheduled at period end"
        );

        Ok(())
    }

    /// Handle `customer.subscription.paused`: provider-initiated suspension
    /// ends access now, not at a billing-interval boundary.
    pub async fn pause(&self, record: &BillingRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_billing
            SET paid_through = NOW(), updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(record.user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %record.user_id, "Subscription paused, access ended now");

        Ok(())
    }

    /// Apply a scheduled downgrade whose effective date has passed.
    ///
    /// Runs at renewal (invoice paid for the new period), the first point
    /// after the old period ends. Returns the plan that took effect, if any.
    pub async fn apply_pending_plan_change(&self, user_id: Uuid) -> BillingResult<Option<Plan>> {
        let applied: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE user_billing
            SET plan = pending_plan,
                pending_plan = NULL,
                pending_plan_effective_date = NULL,
                updated_at = NOW()
            WHERE user_id = $1
              AND pending_plan IS NOT NULL
              AND pending_plan_effective_date <= NOW()
            RETURNING plan
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match applied {
            Some((plan,)) => {
                let plan: Plan = plan
                    .parse()
                    .map_err(|e| BillingError::Internal(format!("stored pending plan: {}", e)))?;
                tracing::info!(user_id = %user_id, plan = %plan, "Scheduled plan change applied");
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    /// Extend paid-through at renewal.
    pub async fn extend_paid_through(
        &self,
        user_id: Uuid,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_billing
            SET paid_through = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Redeem a preorder: clear the stored redemption coupon, set the plan
    /// from the invoice's product, and extend paid-through.
    pub async fn redeem_preorder(
        &self,
        record: &BillingRecord,
        plan: Plan,
        interval: PlanInterval,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_billing
            SET preorder_coupon_id = NULL,
                plan = $2,
                plan_interval = $3,
                paid_through = COALESCE($4, paid_through),
                trial_ends_at = NULL,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(record.user_id)
        .bind(plan.as_str())
        .bind(interval.as_str())
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %record.user_id,
            plan = %plan,
            "Preorder redeemed"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record_with_pending(
        plan: &str,
        pending: Option<&str>,
        effective: Option<OffsetDateTime>,
    ) -> BillingRecord {
        BillingRecord {
            user_id: Uuid::new_v4(),
            plan: plan.to_string(),
            plan_interval: "monthly".to_string(),
            paid_through: None,
            pending_plan: pending.map(str::to_string),
            pending_plan_effective_date: effective,
            trial_ends_at: None,
            stripe_customer_id: Some("cus_1".to_string()),
            preorder_coupon_id: None,
            image_credits: 0,
        }
    }

    #[test]
    fn elapsed_pending_change_counts_as_current_plan() {
        let past = OffsetDateTime::now_utc() - time::Duration::days(3);
        let record = record_with_pending("pro", Some("free"), Some(past));

        assert_eq!(record.current_plan(), Plan::Free);
        // Canceled user re-subscribing to PRO is onboarding, not Unchanged.
        assert_eq!(
            classify_transition(record.current_plan(), Plan::Pro),
            TransitionKind::NewSubscription
        );
        // And to BASIC it is onboarding too, not a downgrade from old PRO.
        assert_eq!(
            classify_transition(record.current_plan(), Plan::Basic),
            TransitionKind::NewSubscription
        );
    }

    #[test]
    fn future_pending_change_leaves_plan_in_effect() {
        let future = OffsetDateTime::now_utc() + time::Duration::days(3);
        let record = record_with_pending("pro", Some("basic"), Some(future));

        assert_eq!(record.current_plan(), Plan::Pro);
    }

    #[test]
    fn no_pending_change_reads_the_plan_column() {
        let record = record_with_pending("basic", None, None);
        assert_eq!(record.current_plan(), Plan::Basic);
    }

    #[test]
    fn pro_to_lower_is_deferred() {
        assert_eq!(
            classify_transition(Plan::Pro, Plan::Basic),
            TransitionKind::DeferredDowngrade
        );
        assert_eq!(
            classify_transition(Plan::Pro, Plan::Free),
            TransitionKind::DeferredDowngrade
        );
    }

    #[test]
    fn free_or_trial_to_paid_is_new_subscription() {
        assert_eq!(
            classify_transition(Plan::Free, Plan::Pro),
            TransitionKind::NewSubscription
        );
        assert_eq!(
            classify_transition(Plan::Trial, Plan::Basic),
            TransitionKind::NewSubscription
        );
    }

    #[test]
    fn basic_to_pro_is_upgrade() {
        assert_eq!(
            classify_transition(Plan::Basic, Plan::Pro),
            TransitionKind::Upgrade
        );
    }

    #[test]
    fn same_plan_is_unchanged() {
        assert_eq!(
            classify_transition(Plan::Pro, Plan::Pro),
            TransitionKind::Unchanged
        );
    }

    #[test]
    fn basic_to_free_applies_immediately_without_notification() {
        assert_eq!(
            classify_transition(Plan::Basic, Plan::Free),
            TransitionKind::Lateral
        );
    }

    #[test]
    fn zero_dollar_invoice_grants_only_with_full_discount() {
        assert!(should_grant_credits(2000, None));
        assert!(should_grant_credits(0, Some(100.0)));
        assert!(!should_grant_credits(0, Some(50.0)));
        assert!(!should_grant_credits(0, None));
    }
}
