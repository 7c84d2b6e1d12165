use chrono::{DateTime, Utc};
use serde::Serialize;
use moka::future::Cache;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState { Pending, Completed }

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentStatus {
    pub payment_id: String,
    pub success: bool,
    pub status: PaymentState,
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

const TRACKED_PAYMENTS: u64 = 10_000;
const TRACKING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Reports a payment as pending until the settle delay has passed since it was
/// first seen, then as completed with a `TXN_<unix millis>` transaction id.
/// Payments are forgotten a day after they were first seen.
pub struct PaymentTracker {
    settle_after: Duration,
    first_seen: Cache<String, DateTime<Utc>>,
}

impl PaymentTracker {
    pub fn new(settle_after: Duration) -> Self {
        Self {
            settle_after,
            first_seen: Cache::builder().max_capacity(TRACKED_PAYMENTS).time_to_live(TRACKING_WINDOW).build(),
        }
    }

    /// Starts the settle clock for `payment_id` if it is not tracked yet.
    pub async fn track(&self, payment_id: &str) {
        self.first_seen.get_with(payment_id.to_string(), async { Utc::now() }).await;
    }

    pub async fn status(&self, payment_id: &str) -> PaymentStatus {
        self.status_at(payment_id, Utc::now()).await
    }

    /// Untracked ids report pending and are not remembered.
    async fn status_at(&self, payment_id: &str, now: DateTime<Utc>) -> PaymentStatus {
        let Some(seen) = self.first_seen.get(payment_id).await else {
            return pending(payment_id, now);
        };
        let settles_at = chrono::Duration::from_std(self.settle_after).ok().and_then(|d| seen.checked_add_signed(d));
        match settles_at {
            Some(at) if now > at => PaymentStatus {
                payment_id: payment_id.to_string(),
                success: true,
                status: PaymentState::Completed,
                transaction_id: Some(format!("TXN_{}", at.timestamp_millis())),
                timestamp: seen,
            },
            _ => pending(payment_id, seen),
        }
    }
}

fn pending(payment_id: &str, at: DateTime<Utc>) -> PaymentStatus {
    PaymentStatus { payment_id: payment_id.to_string(), success: false, status: PaymentState::Pending, transaction_id: None, timestamp: at }
}
