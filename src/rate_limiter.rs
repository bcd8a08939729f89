//! Sliding-window quotas for outbound third-party calls.
//!
//! Counters are shared through a [`CounterStore`] so every worker draws from
//! the same per-service budget. A limiter whose store is unreachable fails
//! open: the pipeline keeps moving and the failure is logged.

use crate::clock::Clock;
use crate::config::RateLimit;
use crate::errors::AppError;
use crate::models::ThirdPartyService;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Atomic sliding-window log keyed by limiter name.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Records one request if fewer than `max` were recorded in the last
    /// `window_ms`. Returns whether it was recorded.
    async fn try_acquire(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<bool, AppError>;

    /// Requests still available in the current window.
    async fn remaining(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<u32, AppError>;
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn evict(window: &mut VecDeque<i64>, window_ms: i64, now_ms: i64) {
    let floor = now_ms - window_ms;
    while window.front().is_some_and(|&at| at <= floor) {
        window.pop_front();
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn try_acquire(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();
        evict(window, window_ms, now_ms);
        if window.len() >= max as usize {
            return Ok(false);
        }
        window.push_back(now_ms);
        Ok(true)
    }

    async fn remaining(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<u32, AppError> {
        let mut windows = self.windows.lock().await;
        let Some(window) = windows.get_mut(key) else {
            return Ok(max);
        };
        evict(window, window_ms, now_ms);
        Ok(max.saturating_sub(window.len() as u32))
    }
}

/// Rate limiter for one third-party integration.
pub struct ApiIntegrationRateLimiter {
    service: ThirdPartyService,
    limit: RateLimit,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl ApiIntegrationRateLimiter {
    pub fn new(
        service: ThirdPartyService,
        limit: RateLimit,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            limit,
            store,
            clock,
        }
    }

    pub fn service(&self) -> ThirdPartyService {
        self.service
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    fn key(&self) -> String {
        format!("rate_limit:{}", self.service.as_str())
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.limit.period_seconds)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000)
    }

    /// Attempts to take one request from the quota.
    ///
    /// # Returns
    ///
    /// * `true` - The call may proceed (also returned when the counter store fails).
    /// * `false` - The quota for the current window is exhausted.
    pub async fn acquire(&self) -> bool {
        match self
            .store
            .try_acquire(
                &self.key(),
                self.limit.max_requests,
                self.window_ms(),
                self.clock.now_millis(),
            )
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(service = %self.service, "Rate limit reached");
                false
            }
            Err(e) => {
                tracing::warn!(
                    service = %self.service,
                    error = %e,
                    "Rate limiter store error, allowing request"
                );
                true
            }
        }
    }

    /// Remaining quota in the current window; the full quota when the store fails.
    pub async fn get_remaining(&self) -> u32 {
        match self
            .store
            .remaining(
                &self.key(),
                self.limit.max_requests,
                self.window_ms(),
                self.clock.now_millis(),
            )
            .await
        {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(
                    service = %self.service,
                    error = %e,
                    "Rate limiter store error, reporting full quota"
                );
                self.limit.max_requests
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn try_acquire(&self, _: &str, _: u32, _: i64, _: i64) -> Result<bool, AppError> {
            Err(AppError::CounterStoreError("connection refused".into()))
        }

        async fn remaining(&self, _: &str, _: u32, _: i64, _: i64) -> Result<u32, AppError> {
            Err(AppError::CounterStoreError("connection refused".into()))
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, clock: Arc<ManualClock>) -> ApiIntegrationRateLimiter {
        ApiIntegrationRateLimiter::new(
            ThirdPartyService::Apollo,
            RateLimit::new(3, 60),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn test_quota_exhausts_and_recovers() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::new(InMemoryCounterStore::new()), clock.clone());

        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert_eq!(limiter.get_remaining().await, 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.get_remaining().await, 3);
        assert!(limiter.acquire().await);
    }

    #[tokio::test]
    async fn test_window_slides_per_request() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::new(InMemoryCounterStore::new()), clock.clone());

        assert!(limiter.acquire().await);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);

        // Only the first request has aged out.
        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.get_remaining().await, 1);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_errors() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(Arc::new(BrokenStore), clock);
        for _ in 0..10 {
            assert!(limiter.acquire().await);
        }
        assert_eq!(limiter.get_remaining().await, 3);
    }
}
