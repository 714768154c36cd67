//! Per-user quota accounting.
//!
//! Usage is reserved before work starts and either committed or released
//! afterwards, so a failed planning call never costs the user a lesson.

use chrono::{DateTime, Datelike, Utc};

use crate::types::{ForgeError, Result};

/// Units held against a user's quota until committed or released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub user: String,
    pub metric: String,
    pub period: String,
    pub quantity: u32,
}

pub trait QuotaService: Send + Sync {
    /// Hold `quantity` units; `QuotaExceeded` when used + reserved would pass `limit`
    fn reserve(
        &self,
        user: &str,
        metric: &str,
        period: &str,
        quantity: u32,
        limit: Option<u32>,
    ) -> Result<Reservation>;

    fn commit(&self, reservation: &Reservation) -> Result<()>;

    fn release(&self, reservation: &Reservation) -> Result<()>;

    /// Units left in the period; `None` when unlimited
    fn remaining(
        &self,
        user: &str,
        metric: &str,
        period: &str,
        limit: Option<u32>,
    ) -> Result<Option<u32>>;

    /// Reserve and commit in one step
    fn consume(
        &self,
        user: &str,
        metric: &str,
        period: &str,
        quantity: u32,
        limit: Option<u32>,
    ) -> Result<()> {
        let reservation = self.reserve(user, metric, period, quantity, limit)?;
        self.commit(&reservation)
    }
}

/// Storage key of the current period for a configured label
pub fn period_key(label: &str, now: DateTime<Utc>) -> String {
    match label {
        "monthly" => format!("{:04}-{:02}", now.year(), now.month()),
        "daily" => now.format("%Y-%m-%d").to_string(),
        "yearly" => format!("{:04}", now.year()),
        other => other.to_string(),
    }
}

/// Check a reservation against a limit
pub fn check_limit(
    metric: &str,
    used: u32,
    reserved: u32,
    quantity: u32,
    limit: Option<u32>,
) -> Result<()> {
    match limit {
        Some(limit) if used + reserved + quantity > limit => Err(ForgeError::QuotaExceeded {
            metric: metric.to_string(),
            limit,
            used: used + reserved,
        }),
        _ => Ok(()),
    }
}
