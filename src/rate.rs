//! Per-credential request budget tracking for the remote host.
//!
//! Every remote call site gates on [`RateTracker::acquire`] and feeds the quota
//! headers of the reply back through [`RateTracker::observe`]. Snapshots live
//! in an in-process cache backed by the `rate_limits` table, so a restarted
//! worker (or a second worker process) picks up the last known budget
//! without probing the host.
//!
//! # Policy
//!
//! | Known snapshot | Reset passed | Remaining > buffer | Proceed |
//! |----------------|--------------|--------------------|---------|
//! | no             | -            | -                  | yes     |
//! | yes            | yes          | -                  | yes     |
//! | yes            | no           | yes                | yes     |
//! | yes            | no           | no                 | no      |

use chrono::Utc;
use reqwest::header::HeaderMap;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;

/// Remaining-requests / limit / reset-time as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub remaining: i64,
    pub limit: i64,
    /// Unix seconds at which the budget refills.
    pub reset_at: i64,
}

impl RateSnapshot {
    fn allows(&self, now_secs: i64, safety_buffer: i64) -> bool {
        now_secs >= self.reset_at || self.remaining > safety_buffer
    }

    fn ms_until_reset(&self, now_ms: i64) -> u64 {
        let reset_ms = self.reset_at.saturating_mul(1000);
        if now_ms >= reset_ms {
            0
        } else {
            (reset_ms - now_ms) as u64
        }
    }
}

/// Parse `x-ratelimit-remaining`, `x-ratelimit-limit` and `x-ratelimit-reset`.
///
/// Returns `None` unless all three headers are present and numeric.
pub fn extract_from_headers(headers: &HeaderMap) -> Option<RateSnapshot> {
    let get = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    Some(RateSnapshot {
        remaining: get("x-ratelimit-remaining")?,
        limit: get("x-ratelimit-limit")?,
        reset_at: get("x-ratelimit-reset")?,
    })
}

/// Rate limiter shared by every remote call made by one worker process.
pub struct RateTracker {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, RateSnapshot>>,
    safety_buffer: i64,
    reset_buffer: Duration,
}

impl RateTracker {
    pub fn new(pool: SqlitePool, config: &RateLimitConfig) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            safety_buffer: config.safety_buffer,
            reset_buffer: Duration::from_millis(config.reset_buffer_ms),
        }
    }

    /// Last known snapshot, from cache or, failing that, the durable copy.
    pub async fn snapshot(&self, credential_id: &str) -> Option<RateSnapshot> {
        if let Some(snap) = self.cached(credential_id) {
            return Some(snap);
        }

        let row = sqlx::query(
            "SELECT remaining, quota, reset_at FROM rate_limits WHERE credential_id = ?",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let snap = RateSnapshot {
                    remaining: row.get("remaining"),
                    limit: row.get("quota"),
                    reset_at: row.get("reset_at"),
                };
                self.cache_insert(credential_id, snap);
                Some(snap)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(credential = credential_id, error = %e, "could not load persisted rate limit");
                None
            }
        }
    }

    pub async fn can_proceed(&self, credential_id: &str) -> bool {
        match self.snapshot(credential_id).await {
            None => true,
            Some(snap) => snap.allows(Utc::now().timestamp(), self.safety_buffer),
        }
    }

    /// Milliseconds a caller must wait before the next request; 0 when it may proceed now.
    pub async fn wait_time_ms(&self, credential_id: &str) -> u64 {
        match self.snapshot(credential_id).await {
            None => 0,
            Some(snap) if snap.allows(Utc::now().timestamp(), self.safety_buffer) => 0,
            Some(snap) => {
                snap.ms_until_reset(Utc::now().timestamp_millis())
                    + self.reset_buffer.as_millis() as u64
            }
        }
    }

    /// Sleep until the recorded reset time plus the configured buffer.
    pub async fn wait_for_reset(&self, credential_id: &str) {
        let Some(snap) = self.snapshot(credential_id).await else {
            return;
        };
        let until_reset = snap.ms_until_reset(Utc::now().timestamp_millis());
        if until_reset == 0 {
            return;
        }
        let wait = Duration::from_millis(until_reset) + self.reset_buffer;
        info!(
            credential = credential_id,
            remaining = snap.remaining,
            wait_ms = wait.as_millis() as u64,
            "rate limit reached, waiting for reset"
        );
        tokio::time::sleep(wait).await;
    }

    /// Gate a remote call: returns once a request may be made.
    pub async fn acquire(&self, credential_id: &str) {
        if !self.can_proceed(credential_id).await {
            self.wait_for_reset(credential_id).await;
        }
    }

    /// Store a snapshot in the cache and the durable table.
    ///
    /// A failed write to the table is logged and otherwise ignored.
    pub async fn record(&self, credential_id: &str, remaining: i64, limit: i64, reset_at: i64) {
        let snap = RateSnapshot {
            remaining,
            limit,
            reset_at,
        };
        self.cache_insert(credential_id, snap);
        debug!(credential = credential_id, remaining, limit, reset_at, "rate limit recorded");

        let result = sqlx::query(
            r#"
            INSERT INTO rate_limits (credential_id, remaining, quota, reset_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(credential_id) DO UPDATE SET
                remaining = excluded.remaining,
                quota = excluded.quota,
                reset_at = excluded.reset_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(credential_id)
        .bind(remaining)
        .bind(limit)
        .bind(reset_at)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(credential = credential_id, error = %e, "could not persist rate limit");
        }
    }

    /// Record the quota carried by a reply, if it had any.
    pub async fn observe(&self, credential_id: &str, quota: Option<RateSnapshot>) {
        if let Some(q) = quota {
            self.record(credential_id, q.remaining, q.limit, q.reset_at)
                .await;
        }
    }

    fn cached(&self, credential_id: &str) -> Option<RateSnapshot> {
        self.cache
            .read()
            .ok()
            .and_then(|c| c.get(credential_id).copied())
    }

    fn cache_insert(&self, credential_id: &str, snap: RateSnapshot) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(credential_id.to_string(), snap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use reqwest::header::HeaderValue;

    fn config(buffer_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            safety_buffer: 100,
            reset_buffer_ms: buffer_ms,
        }
    }

    #[tokio::test]
    async fn unknown_credential_may_proceed() {
        let (_tmp, pool) = test_pool().await;
        let tracker = RateTracker::new(pool, &config(0));
        assert!(tracker.can_proceed("fresh").await);
        assert_eq!(tracker.wait_time_ms("fresh").await, 0);
    }

    #[tokio::test]
    async fn budget_below_buffer_blocks_until_reset() {
        let (_tmp, pool) = test_pool().await;
        let tracker = RateTracker::new(pool, &config(0));
        let reset = Utc::now().timestamp() + 3600;

        tracker.record("cred", 100, 5000, reset).await;
        assert!(!tracker.can_proceed("cred").await);
        assert!(tracker.wait_time_ms("cred").await > 3_500_000);

        tracker.record("cred", 101, 5000, reset).await;
        assert!(tracker.can_proceed("cred").await);
        assert_eq!(tracker.wait_time_ms("cred").await, 0);
    }

    #[tokio::test]
    async fn passed_reset_allows_even_when_exhausted() {
        let (_tmp, pool) = test_pool().await;
        let tracker = RateTracker::new(pool, &config(0));
        tracker
            .record("cred", 0, 5000, Utc::now().timestamp() - 5)
            .await;
        assert!(tracker.can_proceed("cred").await);
    }

    #[tokio::test]
    async fn wait_for_reset_does_not_return_early() {
        let (_tmp, pool) = test_pool().await;
        let tracker = RateTracker::new(pool, &config(50));
        let reset = Utc::now().timestamp() + 1;
        tracker.record("cred", 0, 5000, reset).await;
        assert!(!tracker.can_proceed("cred").await);

        tracker.wait_for_reset("cred").await;
        assert!(Utc::now().timestamp_millis() >= reset * 1000 + 50);
        assert!(tracker.can_proceed("cred").await);
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let (_tmp, pool) = test_pool().await;
        let reset = Utc::now().timestamp() + 600;
        {
            let tracker = RateTracker::new(pool.clone(), &config(0));
            tracker.record("cred", 3, 5000, reset).await;
        }
        let restarted = RateTracker::new(pool, &config(0));
        assert_eq!(
            restarted.snapshot("cred").await,
            Some(RateSnapshot {
                remaining: 3,
                limit: 5000,
                reset_at: reset
            })
        );
        assert!(!restarted.can_proceed("cred").await);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_break_recording() {
        let (_tmp, pool) = test_pool().await;
        sqlx::query("DROP TABLE rate_limits")
            .execute(&pool)
            .await
            .unwrap();
        let tracker = RateTracker::new(pool, &config(0));
        tracker
            .record("cred", 0, 5000, Utc::now().timestamp() + 600)
            .await;
        assert!(!tracker.can_proceed("cred").await);
    }

    #[test]
    fn headers_parse() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        assert_eq!(
            extract_from_headers(&headers),
            Some(RateSnapshot {
                remaining: 4999,
                limit: 5000,
                reset_at: 1_700_000_000
            })
        );

        headers.remove("x-ratelimit-reset");
        assert_eq!(extract_from_headers(&headers), None);
    }
}
