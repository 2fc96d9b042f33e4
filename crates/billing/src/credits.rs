//! Credit ledger
//!
//! All image-credit mutations go through this module. The balance update on
//! `user_billing` and the append-only `credit_audit_log` row are written in a
//! single transaction: an audit entry must never exist without the balance
//! change having taken effect, and vice versa.
//!
//! The ledger does not clamp to zero. A negative balance is a bug signal,
//! not a designed state; grant call sites pass positive deltas and
//! consumption goes through [`CreditLedger::consume`], which pre-checks
//! sufficiency under a row lock.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Why a credit mutation happened. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    /// One-off image-pack purchase.
    Purchase,
    /// Grant from a subscription payment.
    Subscription,
    /// Consumption by the user (image generation).
    UserInitiated,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Purchase => "purchase",
            CreditType::Subscription => "subscription",
            CreditType::UserInitiated => "user_initiated",
        }
    }
}

/// One row of the append-only audit log.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditAuditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quantity: i32,
    pub credit_type: String,
    pub comment: Option<String>,
    pub created_at: OffsetDateTime,
}

pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a signed credit delta and append the paired audit row.
    ///
    /// Returns the new balance. Both writes commit together or not at all.
    pub async fn modify_credits(
        &self,
        user_id: Uuid,
        delta: i32,
        credit_type: CreditType,
        comment: &str,
    ) -> BillingResult<i32> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE user_billing
            SET image_credits = image_credits + $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING image_credits
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await?;

        let new_balance = match updated {
            Some((balance,)) => balance,
            None => return Err(BillingError::UserNotFound(user_id)),
        };

        sqlx::query(
            r#"
            INSERT INTO credit_audit_log (user_id, quantity, credit_type, comment)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .bind(credit_type.as_str())
        .bind(comment)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            delta = delta,
            credit_type = credit_type.as_str(),
            new_balance = new_balance,
            "Credit balance modified"
        );

        Ok(new_balance)
    }

    /// Consume credits for image generation.
    ///
    /// Locks the billing row, verifies sufficiency, then applies the debit
    /// and audit row in the same transaction.
    pub async fn consume(
        &self,
        user_id: Uuid,
        quantity: i32,
        comment: &str,
    ) -> BillingResult<i32> {
        debug_assert!(quantity > 0);

        let mut tx = self.pool.begin().await?;

        let current: Option<(i32,)> =
            sqlx::query_as("SELECT image_credits FROM user_billing WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;

        let balance = match current {
            Some((balance,)) => balance,
            None => return Err(BillingError::UserNotFound(user_id)),
        };

        if balance < quantity {
            return Err(BillingError::InsufficientCredits {
                balance,
                requested: quantity,
            });
        }

        let (new_balance,): (i32,) = sqlx::query_as(
            r#"
            UPDATE user_billing
            SET image_credits = image_credits - $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING image_credits
            "#,
        )
        .bind(user_id)
        .bind(quantity)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_audit_log (user_id, quantity, credit_type, comment)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(-quantity)
        .bind(CreditType::UserInitiated.as_str())
        .bind(comment)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(new_balance)
    }

    /// The user's credit history, most recent first.
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditAuditEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, user_id, quantity, credit_type, comment, created_at
            FROM credit_audit_log
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_type_text_encoding() {
        assert_eq!(CreditType::Purchase.as_str(), "purchase");
        assert_eq!(CreditType::Subscription.as_str(), "subscription");
        assert_eq!(CreditType::UserInitiated.as_str(), "user_initiated");
    }
}
