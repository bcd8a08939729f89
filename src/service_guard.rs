//! Admission and accounting around every outbound third-party call.

use crate::circuit_breaker::CircuitBreakerService;
use crate::errors::IntegrationError;
use crate::models::ThirdPartyService;
use crate::rate_limiter::ApiIntegrationRateLimiter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Consults the breaker, then the service's rate limiter, runs the call and
/// reports the outcome back to the breaker.
///
/// Local refusals (`CircuitOpen`, `Throttled`) and validation errors never
/// reach the breaker's failure count. A HALF_OPEN slot taken by such a
/// call is handed back so the next call can take it.
pub struct ServiceGuard {
    breaker: Arc<CircuitBreakerService>,
    limiters: HashMap<ThirdPartyService, ApiIntegrationRateLimiter>,
}

impl ServiceGuard {
    pub fn new(
        breaker: Arc<CircuitBreakerService>,
        limiters: impl IntoIterator<Item = ApiIntegrationRateLimiter>,
    ) -> Self {
        Self {
            breaker,
            limiters: limiters.into_iter().map(|l| (l.service(), l)).collect(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.breaker
    }

    pub fn limiter(&self, service: ThirdPartyService) -> Option<&ApiIntegrationRateLimiter> {
        self.limiters.get(&service)
    }

    pub async fn call<T, F, Fut>(
        &self,
        service: ThirdPartyService,
        operation: F,
    ) -> Result<T, IntegrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        let admission = self.breaker.admit(service).await;
        if !admission.allowed {
            tracing::debug!(service = %service, "Call refused, circuit open");
            return Err(IntegrationError::CircuitOpen { service });
        }

        if let Some(limiter) = self.limiters.get(&service) {
            if !limiter.acquire().await {
                let remaining = limiter.get_remaining().await;
                tracing::warn!(
                    service = %service,
                    remaining,
                    period_seconds = limiter.limit().period_seconds,
                    "Rate limit exceeded"
                );
                if admission.probe {
                    self.breaker.release_probe(service).await;
                }
                return Err(IntegrationError::Throttled { service });
            }
        }

        let result = operation().await;

        let accounting = match &result {
            Ok(_) => self.breaker.record_success(service).await,
            Err(e) if e.counts_toward_breaker() => {
                self.breaker.record_failure(service, &e.to_string()).await
            }
            Err(_) => {
                if admission.probe {
                    self.breaker.release_probe(service).await;
                }
                Ok(())
            }
        };
        if let Err(e) = accounting {
            tracing::warn!(service = %service, error = %e, "Failed to record call outcome");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerSettings, InMemoryBreakerStore};
    use crate::clock::ManualClock;
    use crate::config::RateLimit;
    use crate::models::CircuitState;
    use crate::rate_limiter::InMemoryCounterStore;
    use std::time::Duration;

    fn guard(threshold: u32, limit: RateLimit) -> ServiceGuard {
        let clock = Arc::new(ManualClock::default());
        let breaker = Arc::new(CircuitBreakerService::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerSettings {
                failure_threshold: threshold,
                ..Default::default()
            },
            clock.clone(),
        ));
        let limiter = ApiIntegrationRateLimiter::new(
            ThirdPartyService::OpenAi,
            limit,
            Arc::new(InMemoryCounterStore::new()),
            clock,
        );
        ServiceGuard::new(breaker, [limiter])
    }

    fn transient() -> IntegrationError {
        IntegrationError::Transient {
            service: ThirdPartyService::OpenAi,
            message: "HTTP 503".into(),
        }
    }

    #[tokio::test]
    async fn test_failures_open_the_circuit_and_short_circuit_calls() {
        let guard = guard(2, RateLimit { max_requests: 100, period_seconds: 60 });
        let service = ThirdPartyService::OpenAi;

        for _ in 0..2 {
            let result: Result<(), _> = guard.call(service, || async { Err(transient()) }).await;
            assert!(result.is_err());
        }
        let state = guard.breaker().get_service_state(service).await.unwrap();
        assert_eq!(state.state, CircuitState::Open);

        let mut invoked = false;
        let result: Result<(), _> = guard
            .call(service, || {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert_eq!(result, Err(IntegrationError::CircuitOpen { service }));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_throttling_and_validation_do_not_count() {
        let guard = guard(1, RateLimit { max_requests: 1, period_seconds: 60 });
        let service = ThirdPartyService::OpenAi;

        let first: Result<(), _> = guard
            .call(service, || async { Err(IntegrationError::Validation("no name".into())) })
            .await;
        assert!(matches!(first, Err(IntegrationError::Validation(_))));

        let second: Result<(), _> = guard.call(service, || async { Ok(()) }).await;
        assert_eq!(second, Err(IntegrationError::Throttled { service }));

        let state = guard.breaker().get_service_state(service).await.unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_slot_survives_local_refusals() {
        let clock = Arc::new(ManualClock::default());
        let breaker = Arc::new(CircuitBreakerService::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerSettings {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
            clock.clone(),
        ));
        let limiter = ApiIntegrationRateLimiter::new(
            ThirdPartyService::OpenAi,
            RateLimit { max_requests: 1, period_seconds: 30 },
            Arc::new(InMemoryCounterStore::new()),
            clock.clone(),
        );
        let guard = ServiceGuard::new(breaker, [limiter]);
        let service = ThirdPartyService::OpenAi;

        let tripped: Result<(), _> = guard.call(service, || async { Err(transient()) }).await;
        assert!(tripped.is_err());
        clock.advance(Duration::from_secs(60));

        // Admitted as the half-open call, but refused before reaching the service.
        let invalid: Result<(), _> = guard
            .call(service, || async { Err(IntegrationError::Validation("no name".into())) })
            .await;
        assert!(matches!(invalid, Err(IntegrationError::Validation(_))));

        // Window is still full: the next half-open call is throttled locally.
        let throttled: Result<(), _> = guard.call(service, || async { Ok(()) }).await;
        assert_eq!(throttled, Err(IntegrationError::Throttled { service }));
        let state = guard.breaker().get_service_state(service).await.unwrap();
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.half_open_calls, 0);

        clock.advance(Duration::from_secs(31));
        let recovered: Result<(), _> = guard.call(service, || async { Ok(()) }).await;
        assert_eq!(recovered, Ok(()));
        let state = guard.breaker().get_service_state(service).await.unwrap();
        assert_eq!(state.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unlimited_service_passes_through() {
        let guard = guard(3, RateLimit { max_requests: 1, period_seconds: 60 });
        for _ in 0..3 {
            let result = guard
                .call(ThirdPartyService::Apollo, || async { Ok::<_, IntegrationError>(7) })
                .await;
            assert_eq!(result, Ok(7));
        }
    }
}
