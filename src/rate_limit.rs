use chrono::{DateTime, Utc};
use log::debug;

use crate::db::{Db, Result};
use crate::models::UserStat;

/// Per-user hourly request limiter backed by the store's `user_stats` table.
///
/// Budgets reset at wall-clock hour boundaries, not on a rolling window.
/// That asymmetry (a user can burst at :59 and again at :00) is deliberate
/// and kept as-is.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    hourly_limit: u32,
}

/// Hour-bucket label at hour granularity, e.g. `2026-08-06-14`.
pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d-%H").to_string()
}

impl RateLimiter {
    pub fn new(hourly_limit: u32) -> Self {
        Self { hourly_limit }
    }

    /// Check and consume one request slot for `user_id`.
    ///
    /// Returns `true` and persists the updated counters when the request is
    /// accepted; returns `false` without mutating state when the user is over
    /// budget for the current hour bucket.
    pub fn allow(&self, db: &mut Db, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let bucket = hour_bucket(now);

        let Some(stat) = db.get_user_stat(user_id)? else {
            // First request ever is always allowed.
            db.upsert_user_stat(&UserStat {
                user_id,
                downloads_count: 0,
                last_request: now,
                requests_hour: 1,
                last_hour_reset: bucket,
            })?;
            return Ok(true);
        };

        // A stale bucket label means the counter logically reset to zero;
        // the persisted reset happens on the accepting write below.
        let used = if stat.last_hour_reset == bucket {
            stat.requests_hour
        } else {
            0
        };

        if used >= self.hourly_limit as i64 {
            debug!("user {user_id} over hourly limit ({used}/{})", self.hourly_limit);
            return Ok(false);
        }

        db.upsert_user_stat(&UserStat {
            last_request: now,
            requests_hour: used + 1,
            last_hour_reset: bucket,
            ..stat
        })?;
        Ok(true)
    }
}
