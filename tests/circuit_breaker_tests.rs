//! Breaker and limiter behaviour through the public service API.

use async_trait::async_trait;
use rust_leadgen_api::circuit_breaker::{
    BreakerSettings, CircuitBreakerObserver, CircuitBreakerService, CircuitEvent,
    InMemoryBreakerStore,
};
use rust_leadgen_api::clock::ManualClock;
use rust_leadgen_api::config::RateLimit;
use rust_leadgen_api::errors::AppError;
use rust_leadgen_api::models::{CircuitState, ThirdPartyService};
use rust_leadgen_api::rate_limiter::{ApiIntegrationRateLimiter, InMemoryCounterStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CircuitEvent>>,
}

#[async_trait]
impl CircuitBreakerObserver for Recorder {
    async fn on_circuit_event(&self, event: &CircuitEvent) -> Result<(), AppError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl CircuitBreakerObserver for Failing {
    async fn on_circuit_event(&self, _event: &CircuitEvent) -> Result<(), AppError> {
        Err(AppError::InternalError("observer down".to_string()))
    }
}

fn breaker(clock: Arc<ManualClock>) -> CircuitBreakerService {
    CircuitBreakerService::new(
        Arc::new(InMemoryBreakerStore::new()),
        BreakerSettings {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        },
        clock,
    )
}

#[tokio::test]
async fn test_threshold_opens_and_cooldown_admits_one_probe() {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker(clock.clone());
    let apollo = ThirdPartyService::Apollo;

    for _ in 0..3 {
        assert!(breaker.is_call_allowed(apollo).await);
        breaker.record_failure(apollo, "HTTP 503").await.unwrap();
    }

    let state = breaker.get_service_state(apollo).await.unwrap();
    assert_eq!(state.state, CircuitState::Open);
    assert_eq!(state.failure_count, 3);
    assert!(!breaker.is_call_allowed(apollo).await);

    clock.advance(Duration::from_secs(59));
    assert!(!breaker.is_call_allowed(apollo).await);

    clock.advance(Duration::from_secs(1));
    assert!(breaker.is_call_allowed(apollo).await);
    assert!(!breaker.is_call_allowed(apollo).await);
    assert_eq!(
        breaker.get_service_state(apollo).await.unwrap().state,
        CircuitState::HalfOpen
    );

    breaker.record_success(apollo).await.unwrap();
    let state = breaker.get_service_state(apollo).await.unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test]
async fn test_other_services_unaffected() {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker(clock);

    for _ in 0..3 {
        breaker
            .record_failure(ThirdPartyService::OpenAi, "HTTP 500")
            .await
            .unwrap();
    }

    assert!(!breaker.is_call_allowed(ThirdPartyService::OpenAi).await);
    assert!(breaker.is_call_allowed(ThirdPartyService::Apollo).await);
    assert!(breaker.is_call_allowed(ThirdPartyService::Instantly).await);

    let status = breaker.get_circuit_status().await.unwrap();
    assert_eq!(status.services.len(), ThirdPartyService::ALL.len());
    assert_eq!(
        status.services[&ThirdPartyService::OpenAi].circuit_state,
        CircuitState::Open
    );
    assert_eq!(
        status.services[&ThirdPartyService::Perplexity].circuit_state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_observers_see_each_transition_once() {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker(clock.clone());
    let recorder = Arc::new(Recorder::default());
    breaker.subscribe(Arc::new(Failing)).await;
    breaker.subscribe(recorder.clone()).await;

    let service = ThirdPartyService::Perplexity;
    for _ in 0..5 {
        breaker.record_failure(service, "timeout").await.unwrap();
    }
    clock.advance(Duration::from_secs(61));
    assert!(breaker.is_call_allowed(service).await);
    breaker.record_success(service).await.unwrap();

    let events = recorder.events.lock().await;
    assert_eq!(events.len(), 2);
    match &events[0] {
        CircuitEvent::Opened {
            service: s,
            reason,
            context,
        } => {
            assert_eq!(*s, service);
            assert_eq!(reason, "timeout");
            assert_eq!(context.failure_count, 3);
            assert!(!context.manual);
        }
        other => panic!("expected opened event, got {:?}", other),
    }
    assert_eq!(
        events[1],
        CircuitEvent::Closed {
            service,
            manual: false
        }
    );
}

#[tokio::test]
async fn test_failed_probe_reopens() {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker(clock.clone());
    let recorder = Arc::new(Recorder::default());
    breaker.subscribe(recorder.clone()).await;
    let service = ThirdPartyService::Instantly;

    for _ in 0..3 {
        breaker.record_failure(service, "HTTP 502").await.unwrap();
    }
    clock.advance(Duration::from_secs(60));
    assert!(breaker.is_call_allowed(service).await);
    breaker.record_failure(service, "HTTP 502").await.unwrap();

    assert_eq!(
        breaker.get_service_state(service).await.unwrap().state,
        CircuitState::Open
    );
    assert!(!breaker.is_call_allowed(service).await);
    assert_eq!(recorder.events.lock().await.len(), 2);
}

#[tokio::test]
async fn test_manual_pause_holds_past_cooldown() {
    let clock = Arc::new(ManualClock::default());
    let breaker = breaker(clock.clone());
    let recorder = Arc::new(Recorder::default());
    breaker.subscribe(recorder.clone()).await;
    let service = ThirdPartyService::Apollo;

    let record = breaker
        .manually_pause_service(service, "quota review")
        .await
        .unwrap();
    assert_eq!(record.state, CircuitState::Open);
    assert!(record.manual_override);

    clock.advance(Duration::from_secs(3_600));
    assert!(!breaker.is_call_allowed(service).await);

    let record = breaker.manually_resume_service(service).await.unwrap();
    assert_eq!(record.state, CircuitState::Closed);
    assert!(!record.manual_override);
    assert!(breaker.is_call_allowed(service).await);

    let events = recorder.events.lock().await;
    assert!(matches!(
        &events[0],
        CircuitEvent::Opened { context, .. } if context.manual
    ));
    assert_eq!(
        events[1],
        CircuitEvent::Closed {
            service,
            manual: true
        }
    );
}

#[tokio::test]
async fn test_rate_limiter_single_slot_window() {
    let clock = Arc::new(ManualClock::default());
    let limiter = ApiIntegrationRateLimiter::new(
        ThirdPartyService::OpenAi,
        RateLimit::new(1, 60),
        Arc::new(InMemoryCounterStore::new()),
        clock.clone(),
    );

    assert_eq!(limiter.get_remaining().await, 1);
    assert!(limiter.acquire().await);
    assert!(!limiter.acquire().await);
    assert_eq!(limiter.get_remaining().await, 0);

    clock.advance(Duration::from_secs(61));
    assert_eq!(limiter.get_remaining().await, 1);
    assert!(limiter.acquire().await);
}

#[tokio::test]
async fn test_limiters_do_not_share_quota() {
    let clock = Arc::new(ManualClock::default());
    let counters = Arc::new(InMemoryCounterStore::new());
    let openai = ApiIntegrationRateLimiter::new(
        ThirdPartyService::OpenAi,
        RateLimit::new(1, 60),
        counters.clone(),
        clock.clone(),
    );
    let apollo = ApiIntegrationRateLimiter::new(
        ThirdPartyService::Apollo,
        RateLimit::new(1, 60),
        counters,
        clock,
    );

    assert!(openai.acquire().await);
    assert!(!openai.acquire().await);
    assert!(apollo.acquire().await);
}
