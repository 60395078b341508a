//! Fixed-window rate limiter.
//!
//! One counter per `(username, route, second)` document, shared by every
//! worker through the store. Counters near a window boundary may briefly
//! overcount by one; that slack is an accepted property of the lock-free
//! design.

use std::sync::Arc;

use chrono::Utc;

use crate::errors::{ApiError, ApiResult};
use crate::storage::Store;

pub struct RateLimiter {
    store: Arc<dyn Store>,
    /// Calls per second; `None` disables the limiter entirely.
    limit: Option<u32>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, limit: Option<u32>) -> Self {
        Self { store, limit }
    }

    pub async fn check(&self, username: &str, route: &str) -> ApiResult<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        let second = Utc::now().timestamp().max(0) as u64;
        let count = self.store.increment_usage(username, route, second).await?;
        if count > u64::from(limit) {
            tracing::warn!(username, route, count, limit, "rate limit exceeded");
            return Err(ApiError::RateLimited { route: route.to_string(), retry_after_secs: 1 });
        }
        Ok(())
    }
}
