//! Shared types and database plumbing for the Conjure backend.
//!
//! The plan/interval enums live here because feature-gating code outside the
//! billing crate reads `user_billing` rows and must agree on their encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Subscription tier controlling feature access and credit grants.
///
/// Stored as lowercase text in `user_billing.plan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Trial,
    Basic,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Trial => "trial",
            Plan::Basic => "basic",
            Plan::Pro => "pro",
        }
    }

    /// Whether this plan represents a paying subscription.
    /// TRIAL counts as unpaid, same as FREE.
    pub fn is_paid(&self) -> bool {
        matches!(self, Plan::Basic | Plan::Pro)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ParsePlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "trial" => Ok(Plan::Trial),
            "basic" => Ok(Plan::Basic),
            "pro" => Ok(Plan::Pro),
            other => Err(ParsePlanError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct ParsePlanError(pub String);

/// Billing interval for a subscription.
///
/// Stored as lowercase text in `user_billing.plan_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanInterval {
    Monthly,
    Yearly,
}

impl PlanInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanInterval::Monthly => "monthly",
            PlanInterval::Yearly => "yearly",
        }
    }
}

impl fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlanInterval {
    type Err = ParsePlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(PlanInterval::Monthly),
            "yearly" => Ok(PlanInterval::Yearly),
            other => Err(ParsePlanError(other.to_string())),
        }
    }
}

/// Create the application connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
///
/// Called against a direct (non-pooler) connection at deploy time.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn plan_round_trips_through_text() {
        for plan in [Plan::Free, Plan::Trial, Plan::Basic, Plan::Pro] {
            assert_eq!(plan.as_str().parse::<Plan>().unwrap(), plan);
        }
    }

    #[test]
    fn only_basic_and_pro_are_paid() {
        assert!(!Plan::Free.is_paid());
        assert!(!Plan::Trial.is_paid());
        assert!(Plan::Basic.is_paid());
        assert!(Plan::Pro.is_paid());
    }

    #[test]
    fn unknown_plan_is_an_error() {
        assert!("platinum".parse::<Plan>().is_err());
    }
}
