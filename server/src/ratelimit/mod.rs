//! Per-identity sliding-window rate limiting.
//!
//! Every call appends itself to the ledger first and then counts the
//! identity's entries in the trailing window, so rejected calls also consume
//! a slot. A failed append or count rejects the call.

pub mod ledger;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::models::RequestLedgerEntry;
pub use ledger::{LedgerError, RequestLedger, SqliteLedger};

/// Quota for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Rejected {
        retry_after_secs: u64,
        reset_at: DateTime<Utc>,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    ledger: Arc<dyn RequestLedger>,
    timeout: std::time::Duration,
}

impl RateLimiter {
    /// `timeout` bounds the whole append-and-count exchange with the ledger.
    pub fn new(ledger: Arc<dyn RequestLedger>, timeout: std::time::Duration) -> Self {
        Self { ledger, timeout }
    }

    pub async fn admit(
        &self,
        identity_id: i64,
        endpoint: &str,
        rule: RateRule,
    ) -> Result<Admission, LedgerError> {
        self.admit_at(identity_id, endpoint, rule, Utc::now()).await
    }

    /// A timed-out call is not retried: the append may already have landed.
    pub async fn admit_at(
        &self,
        identity_id: i64,
        endpoint: &str,
        rule: RateRule,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        let ledger = self.ledger.clone();
        let endpoint = endpoint.to_string();
        let task = tokio::task::spawn_blocking(move || {
            evaluate(ledger.as_ref(), identity_id, &endpoint, rule, now)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(LedgerError::Task(e.to_string())),
            Err(_) => Err(LedgerError::Timeout),
        }
    }
}

/// Append-then-count admission decision against `now`.
pub fn evaluate(
    ledger: &dyn RequestLedger,
    identity_id: i64,
    endpoint: &str,
    rule: RateRule,
    now: DateTime<Utc>,
) -> Result<Admission, LedgerError> {
    let now_ms = now.timestamp_millis();
    let window_ms = i64::try_from(rule.window_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    let since_ms = now_ms.saturating_sub(window_ms);

    ledger.append(&RequestLedgerEntry {
        identity_id,
        endpoint: endpoint.to_string(),
        ts_ms: now_ms,
    })?;

    let count = ledger.count_since(identity_id, since_ms)?;
    let limit = rule.limit as u64;

    if count <= limit {
        let oldest_ms = ledger
            .nth_oldest_since(identity_id, since_ms, 0)
            .ok()
            .flatten()
            .unwrap_or(now_ms);
        return Ok(Admission::Allowed {
            remaining: (limit - count) as u32,
            reset_at: millis_to_datetime(oldest_ms.saturating_add(window_ms), now),
        });
    }

    // The caller is back under the limit once the (count - limit)-th oldest
    // entry leaves the window.
    let retry_after_secs = match ledger.nth_oldest_since(identity_id, since_ms, count - limit - 1) {
        Ok(Some(ts_ms)) => ceil_secs(ts_ms.saturating_add(window_ms) - now_ms).max(1),
        Ok(None) => rule.window_secs.max(1),
        Err(e) => {
            tracing::warn!(
                identity_id,
                error = %e,
                "Could not read window edge, falling back to full window"
            );
            rule.window_secs.max(1)
        }
    };

    Ok(Admission::Rejected {
        retry_after_secs,
        reset_at: Duration::try_seconds(i64::try_from(retry_after_secs).unwrap_or(i64::MAX))
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now),
    })
}

fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        0
    } else {
        ((ms + 999) / 1000) as u64
    }
}

fn millis_to_datetime(ms: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(fallback)
}
