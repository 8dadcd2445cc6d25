//! Per-user sliding-window command quota.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

/// Limits how many commands each user may issue per minute. A limit of 0
/// admits everything.
pub struct QuotaTracker {
    max_per_window: u32,
    issued: Mutex<HashMap<String, Vec<Instant>>>,
}

impl QuotaTracker {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Record a command for `user_id` if the user is under the limit.
    /// Returns false when the user has to wait.
    pub fn check(&self, user_id: &str) -> bool {
        if self.max_per_window == 0 {
            return true;
        }
        let mut map = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        // Drop users whose window has fully expired.
        map.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < WINDOW);
            !stamps.is_empty()
        });

        let stamps = map.entry(user_id.to_string()).or_default();
        if stamps.len() >= self.max_per_window as usize {
            warn!(user_id, count = stamps.len(), limit = self.max_per_window,
                "Command quota exceeded");
            return false;
        }

        stamps.push(now);
        debug!(user_id, used = stamps.len(), "Command admitted");
        true
    }

    /// Commands `user_id` may still issue in the current window.
    pub fn remaining(&self, user_id: &str) -> u32 {
        if self.max_per_window == 0 {
            return u32::MAX;
        }
        let map = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let used = map
            .get(user_id)
            .map(|stamps| stamps.iter().filter(|t| now.duration_since(**t) < WINDOW).count())
            .unwrap_or(0);
        self.max_per_window.saturating_sub(used as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_quota_blocks_then_recovers() {
        let quota = QuotaTracker::new(2);
        assert!(quota.check("alice"));
        assert!(quota.check("alice"));
        assert!(!quota.check("alice"));
        assert_eq!(quota.remaining("alice"), 0);

        tokio::time::advance(WINDOW).await;
        assert_eq!(quota.remaining("alice"), 2);
        assert!(quota.check("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_is_per_user() {
        let quota = QuotaTracker::new(1);
        assert!(quota.check("alice"));
        assert!(quota.check("bob"));
        assert!(!quota.check("alice"));
        assert!(!quota.check("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_is_unlimited() {
        let quota = QuotaTracker::new(0);
        for _ in 0..100 {
            assert!(quota.check("alice"));
        }
        assert_eq!(quota.remaining("alice"), u32::MAX);
    }
}
