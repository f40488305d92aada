//! Rate Limiter — per-user daily-quota check over the task creation table
//! (spec.md §4.1 "Rate Limiter").
//!
//! The teacher has no direct analogue (single-project board, no per-user
//! quotas), so this is grounded on the Task Store query shape alone:
//! `TaskDb::count_tasks_since`/`oldest_task_created_at`, following the
//! same `conn.query_row` style as `factory::db`'s other aggregate reads.

use crate::store::DbHandle;

const DEFAULT_QUOTA: i64 = 20;
const ADMIN_QUOTA: i64 = 100;
const WINDOW: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub total: i64,
    pub reset_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    db: DbHandle,
    admin_email_domains: Vec<String>,
}

impl RateLimiter {
    pub fn new(db: DbHandle, admin_email_domains: Vec<String>) -> Self {
        Self { db, admin_email_domains }
    }

    fn total_for(&self, email: &str) -> i64 {
        let domain = email.rsplit_once('@').map(|(_, d)| d.to_ascii_lowercase());
        match domain {
            Some(d) if self.admin_email_domains.iter().any(|allowed| allowed.eq_ignore_ascii_case(&d)) => ADMIN_QUOTA,
            _ => DEFAULT_QUOTA,
        }
    }

    /// Counts this user's non-soft-deleted tasks created within the
    /// trailing 24h window. A Task Store query error fails open
    /// (`allowed: true`) per spec.md §4.1: a brief availability loss here
    /// is worse than blocking admission during a database hiccup.
    pub async fn check_allowed(&self, user_id: &str, email: &str) -> RateLimitResult {
        let total = self.total_for(email);
        let now = chrono::Utc::now();
        let since = now - WINDOW;

        let db = self.db.clone();
        let uid = user_id.to_string();
        let count = match db.call(move |conn| conn.count_tasks_since(&uid, since)).await {
            Ok(c) => c,
            Err(_) => {
                return RateLimitResult { allowed: true, remaining: total, total, reset_at: now };
            }
        };

        let db = self.db.clone();
        let uid = user_id.to_string();
        let oldest = db.call(move |conn| conn.oldest_task_created_at(&uid, since)).await.ok().flatten();
        let reset_at = oldest.map(|t| t + WINDOW).unwrap_or(now);

        RateLimitResult {
            allowed: count < total,
            remaining: (total - count).max(0),
            total,
            reset_at,
        }
    }
}
