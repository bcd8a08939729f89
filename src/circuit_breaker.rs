//! Per-service circuit breakers with shared state and an event stream.
//!
//! # States
//!
//! - **CLOSED**: Normal operation, calls pass through. Consecutive genuine
//!   failures are counted; reaching the threshold trips the breaker.
//! - **OPEN**: Calls are refused locally. After the cool-down the next
//!   admission attempt moves the breaker to HALF_OPEN.
//! - **HALF_OPEN**: A bounded number of probe calls is admitted. A success
//!   closes the breaker, a failure re-opens it.
//!
//! A manual pause holds the breaker OPEN with `manual_override` set, so the
//! cool-down never produces a probe until an operator resumes the service.
//!
//! State lives behind [`BreakerStore`] so every worker process sees the same
//! breaker; the store applies each transition atomically.

use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::{CircuitBreakerRecord, CircuitState, ThirdPartyService};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown_millis(&self) -> i64 {
        i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failure_count: u32,
    /// True only for the call that moved the breaker to OPEN.
    pub opened: bool,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDecision {
    pub allowed: bool,
    pub entered_half_open: bool,
    /// The call holds one of the HALF_OPEN probe slots.
    pub probe: bool,
}

impl CallDecision {
    const PASS: Self = Self {
        allowed: true,
        entered_half_open: false,
        probe: false,
    };
    const REFUSE: Self = Self {
        allowed: false,
        entered_half_open: false,
        probe: false,
    };
    const PROBE: Self = Self {
        allowed: true,
        entered_half_open: false,
        probe: true,
    };
}

// ============ Pure state machine ============

impl CircuitBreakerRecord {
    fn trip(&mut self, reason: &str, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_at = None;
        self.half_open_calls = 0;
        self.pause_info = Some(reason.to_string());
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.half_open_at = None;
        self.half_open_calls = 0;
        self.pause_info = None;
        self.manual_override = false;
    }

    /// Counts a genuine call failure. Returns `true` when this failure opened the breaker.
    pub fn apply_failure(&mut self, reason: &str, threshold: u32, now: DateTime<Utc>) -> bool {
        self.failure_threshold = threshold;
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.failure_count >= threshold => {
                self.trip(reason, now);
                true
            }
            CircuitState::HalfOpen => {
                self.trip(reason, now);
                true
            }
            _ => false,
        }
    }

    /// Returns `true` when the success closed a half-open breaker.
    pub fn apply_success(&mut self) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                self.reset();
                true
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                false
            }
            // A call admitted before the breaker opened; the open decision stands.
            CircuitState::Open => false,
        }
    }

    pub fn try_acquire(&mut self, settings: &BreakerSettings, now: DateTime<Utc>) -> CallDecision {
        let cooldown = ChronoDuration::milliseconds(settings.cooldown_millis());
        match self.state {
            CircuitState::Closed => CallDecision::PASS,
            CircuitState::Open => {
                let cooled = self.opened_at.map_or(true, |at| at + cooldown <= now);
                if self.manual_override || !cooled {
                    return CallDecision::REFUSE;
                }
                self.state = CircuitState::HalfOpen;
                self.half_open_at = Some(now);
                self.half_open_calls = 1;
                CallDecision {
                    entered_half_open: true,
                    ..CallDecision::PROBE
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back must not wedge the breaker.
                let stale = self.half_open_at.map_or(true, |at| at + cooldown <= now);
                if stale {
                    self.half_open_at = Some(now);
                    self.half_open_calls = 1;
                    return CallDecision::PROBE;
                }
                if self.half_open_calls < settings.half_open_max_calls {
                    self.half_open_calls += 1;
                    CallDecision::PROBE
                } else {
                    CallDecision::REFUSE
                }
            }
        }
    }

    /// Hands back a probe slot whose call never reached the service.
    /// Returns `false` when the breaker has left HALF_OPEN meanwhile.
    pub fn release_probe(&mut self) -> bool {
        if self.state == CircuitState::HalfOpen && self.half_open_calls > 0 {
            self.half_open_calls -= 1;
            true
        } else {
            false
        }
    }

    pub fn apply_manual_pause(&mut self, reason: &str, now: DateTime<Utc>) {
        self.trip(reason, now);
        self.manual_override = true;
    }

    pub fn apply_manual_resume(&mut self) {
        self.reset();
    }
}

// ============ Storage seam ============

/// Shared breaker state. Each method is one atomic read-modify-write.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Missing state reads as a fresh CLOSED record.
    async fn load(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError>;

    async fn record_failure(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AppError>;

    /// Returns `true` when the success closed a half-open breaker.
    async fn record_success(&self, service: ThirdPartyService) -> Result<bool, AppError>;

    async fn try_acquire(
        &self,
        service: ThirdPartyService,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<CallDecision, AppError>;

    async fn release_probe(&self, service: ThirdPartyService) -> Result<bool, AppError>;

    async fn force_open(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerRecord, AppError>;

    async fn force_close(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError>;
}

/// Process-local store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryBreakerStore {
    records: Mutex<HashMap<ThirdPartyService, CircuitBreakerRecord>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&service)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerRecord::closed(service, threshold)))
    }

    async fn record_failure(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AppError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(service)
            .or_insert_with(|| CircuitBreakerRecord::closed(service, threshold));
        let opened = record.apply_failure(reason, threshold, now);
        Ok(FailureOutcome {
            failure_count: record.failure_count,
            opened,
        })
    }

    async fn record_success(&self, service: ThirdPartyService) -> Result<bool, AppError> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(&service)
            .map(|record| record.apply_success())
            .unwrap_or(false))
    }

    async fn try_acquire(
        &self,
        service: ThirdPartyService,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<CallDecision, AppError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(service)
            .or_insert_with(|| CircuitBreakerRecord::closed(service, settings.failure_threshold));
        Ok(record.try_acquire(settings, now))
    }

    async fn release_probe(&self, service: ThirdPartyService) -> Result<bool, AppError> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(&service)
            .map(|record| record.release_probe())
            .unwrap_or(false))
    }

    async fn force_open(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(service)
            .or_insert_with(|| CircuitBreakerRecord::closed(service, threshold));
        record.apply_manual_pause(reason, now);
        Ok(record.clone())
    }

    async fn force_close(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(service)
            .or_insert_with(|| CircuitBreakerRecord::closed(service, threshold));
        record.apply_manual_resume();
        Ok(record.clone())
    }
}

// ============ Events ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedContext {
    pub failure_count: u32,
    pub manual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CircuitEvent {
    Opened {
        service: ThirdPartyService,
        reason: String,
        context: OpenedContext,
    },
    Closed {
        service: ThirdPartyService,
        manual: bool,
    },
}

impl CircuitEvent {
    pub fn service(&self) -> ThirdPartyService {
        match self {
            CircuitEvent::Opened { service, .. } | CircuitEvent::Closed { service, .. } => {
                *service
            }
        }
    }
}

/// Receives breaker transitions. Errors are logged by the publisher and never
/// reach the code that triggered the transition.
#[async_trait]
pub trait CircuitBreakerObserver: Send + Sync {
    async fn on_circuit_event(&self, event: &CircuitEvent) -> Result<(), AppError>;
}

// ============ Service ============

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCircuitStatus {
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub pause_info: Option<String>,
    pub manual_override: bool,
}

impl From<CircuitBreakerRecord> for ServiceCircuitStatus {
    fn from(record: CircuitBreakerRecord) -> Self {
        Self {
            circuit_state: record.state,
            failure_count: record.failure_count,
            failure_threshold: record.failure_threshold,
            opened_at: record.opened_at,
            pause_info: record.pause_info,
            manual_override: record.manual_override,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatusSnapshot {
    pub services: BTreeMap<ThirdPartyService, ServiceCircuitStatus>,
    pub timestamp: DateTime<Utc>,
}

pub struct CircuitBreakerService {
    store: Arc<dyn BreakerStore>,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    observers: RwLock<Vec<Arc<dyn CircuitBreakerObserver>>>,
}

impl CircuitBreakerService {
    pub fn new(store: Arc<dyn BreakerStore>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            settings,
            clock,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn BreakerStore> {
        Arc::clone(&self.store)
    }

    pub async fn subscribe(&self, observer: Arc<dyn CircuitBreakerObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Delivers an event to every observer in registration order.
    async fn publish(&self, event: CircuitEvent) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            if let Err(e) = observer.on_circuit_event(&event).await {
                tracing::error!(
                    service = %event.service(),
                    error = %e,
                    "Circuit breaker observer failed"
                );
            }
        }
    }

    /// Admission check. Store failures fail open so a broken counter store
    /// does not halt the pipeline.
    pub async fn is_call_allowed(&self, service: ThirdPartyService) -> bool {
        self.admit(service).await.allowed
    }

    /// [`Self::is_call_allowed`] that also reports whether the caller now holds
    /// a HALF_OPEN probe slot.
    pub async fn admit(&self, service: ThirdPartyService) -> CallDecision {
        match self
            .store
            .try_acquire(service, &self.settings, self.clock.now())
            .await
        {
            Ok(decision) => {
                if decision.entered_half_open {
                    tracing::info!(service = %service, "🟡 Circuit half-open, admitting probe call");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Breaker store unavailable, allowing call");
                CallDecision::PASS
            }
        }
    }

    /// Returns a probe slot taken by [`Self::admit`] when the call produced no
    /// verdict on the service.
    pub async fn release_probe(&self, service: ThirdPartyService) {
        match self.store.release_probe(service).await {
            Ok(true) => tracing::debug!(service = %service, "Probe slot released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(service = %service, error = %e, "Failed to release probe slot"),
        }
    }

    pub async fn record_success(&self, service: ThirdPartyService) -> Result<(), AppError> {
        let closed = self.store.record_success(service).await?;
        if closed {
            tracing::info!(service = %service, "🟢 Circuit closed after successful probe");
            self.publish(CircuitEvent::Closed {
                service,
                manual: false,
            })
            .await;
        }
        Ok(())
    }

    pub async fn record_failure(
        &self,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<(), AppError> {
        let outcome = self
            .store
            .record_failure(
                service,
                reason,
                self.settings.failure_threshold,
                self.clock.now(),
            )
            .await?;

        if outcome.opened {
            tracing::warn!(
                service = %service,
                failures = outcome.failure_count,
                reason = reason,
                "🔴 Circuit opened"
            );
            self.publish(CircuitEvent::Opened {
                service,
                reason: reason.to_string(),
                context: OpenedContext {
                    failure_count: outcome.failure_count,
                    manual: false,
                },
            })
            .await;
        } else {
            tracing::debug!(
                service = %service,
                failures = outcome.failure_count,
                "Recorded service failure"
            );
        }
        Ok(())
    }

    /// Forces the breaker OPEN and holds it there until [`Self::manually_resume_service`].
    pub async fn manually_pause_service(
        &self,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let record = self
            .store
            .force_open(
                service,
                reason,
                self.settings.failure_threshold,
                self.clock.now(),
            )
            .await?;
        tracing::warn!(service = %service, reason = reason, "⏸ Service manually paused");
        self.publish(CircuitEvent::Opened {
            service,
            reason: reason.to_string(),
            context: OpenedContext {
                failure_count: record.failure_count,
                manual: true,
            },
        })
        .await;
        Ok(record)
    }

    pub async fn manually_resume_service(
        &self,
        service: ThirdPartyService,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let record = self
            .store
            .force_close(service, self.settings.failure_threshold)
            .await?;
        tracing::info!(service = %service, "▶ Service manually resumed");
        self.publish(CircuitEvent::Closed {
            service,
            manual: true,
        })
        .await;
        Ok(record)
    }

    pub async fn get_service_state(
        &self,
        service: ThirdPartyService,
    ) -> Result<CircuitBreakerRecord, AppError> {
        self.store
            .load(service, self.settings.failure_threshold)
            .await
    }

    pub async fn get_circuit_status(&self) -> Result<CircuitStatusSnapshot, AppError> {
        let mut services = BTreeMap::new();
        for service in ThirdPartyService::ALL {
            let record = self.get_service_state(service).await?;
            services.insert(service, ServiceCircuitStatus::from(record));
        }
        Ok(CircuitStatusSnapshot {
            services,
            timestamp: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Apollo, 3);
        assert!(!record.apply_failure("500", 3, now));
        assert!(!record.apply_failure("500", 3, now));
        assert!(record.apply_failure("500", 3, now));
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.pause_info.as_deref(), Some("500"));

        // Further failures while open do not re-emit.
        assert!(!record.apply_failure("500", 3, now));
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::OpenAi, 3);
        record.apply_failure("timeout", 3, now);
        record.apply_failure("timeout", 3, now);
        assert!(!record.apply_success());
        assert_eq!(record.failure_count, 0);
        assert!(!record.apply_failure("timeout", 3, now));
    }

    #[test]
    fn test_open_refuses_until_cooldown() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Apollo, 1);
        record.apply_failure("boom", 1, now);

        let denied = record.try_acquire(&settings(), now + ChronoDuration::seconds(59));
        assert!(!denied.allowed);

        let probe = record.try_acquire(&settings(), now + ChronoDuration::seconds(60));
        assert!(probe.allowed);
        assert!(probe.entered_half_open);
        assert_eq!(record.state, CircuitState::HalfOpen);

        let second = record.try_acquire(&settings(), now + ChronoDuration::seconds(61));
        assert!(!second.allowed);
    }

    #[test]
    fn test_released_half_open_slot_admits_next_call() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::OpenAi, 1);
        record.apply_failure("boom", 1, now);

        let first = record.try_acquire(&settings(), now + ChronoDuration::seconds(60));
        assert!(first.probe);
        assert!(!record.try_acquire(&settings(), now + ChronoDuration::seconds(61)).allowed);

        assert!(record.release_probe());
        let retry = record.try_acquire(&settings(), now + ChronoDuration::seconds(62));
        assert!(retry.allowed);
        assert!(retry.probe);
        assert!(!retry.entered_half_open);

        record.apply_success();
        assert!(!record.release_probe());
        assert!(!record.try_acquire(&settings(), now + ChronoDuration::seconds(63)).probe);
    }

    #[test]
    fn test_half_open_probe_outcomes() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Instantly, 1);
        record.apply_failure("boom", 1, now);
        record.try_acquire(&settings(), now + ChronoDuration::seconds(60));

        let mut failed = record.clone();
        assert!(failed.apply_failure("still down", 1, now + ChronoDuration::seconds(61)));
        assert_eq!(failed.state, CircuitState::Open);

        assert!(record.apply_success());
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
    }

    #[test]
    fn test_manual_pause_blocks_probe() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Perplexity, 5);
        record.apply_manual_pause("maintenance", now);
        let later = now + ChronoDuration::hours(2);
        assert!(!record.try_acquire(&settings(), later).allowed);

        record.apply_manual_resume();
        assert_eq!(record.state, CircuitState::Closed);
        assert!(!record.manual_override);
        assert!(record.try_acquire(&settings(), later).allowed);
    }

    #[test]
    fn test_stale_probe_is_replaced() {
        let now = Utc::now();
        let mut record = CircuitBreakerRecord::closed(ThirdPartyService::Apollo, 1);
        record.apply_failure("boom", 1, now);
        record.try_acquire(&settings(), now + ChronoDuration::seconds(60));
        assert!(!record.try_acquire(&settings(), now + ChronoDuration::seconds(90)).allowed);
        assert!(record.try_acquire(&settings(), now + ChronoDuration::seconds(121)).allowed);
    }
}
