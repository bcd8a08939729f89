//! Job state machine and failure policy.
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──ok──▶ COMPLETED
//!    ▲                  │  │  └──exhausted / invalid──▶ FAILED
//!    │ retry            │  └──breaker open──▶ PAUSED ──resume──▶ PENDING
//!    └──────────────────┘
//! any non-terminal ──cancel──▶ CANCELLED
//! ```
//!
//! Everything here is pure; the store applies the resulting changes with
//! compare-and-set so a losing writer simply observes `None`.

use crate::errors::{AppError, IntegrationError};
use crate::models::{Job, JobStatus, JobStatusChange, ThirdPartyService};
use chrono::{DateTime, Utc};
use std::time::Duration;

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Paused)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Paused)
                | (Processing, Pending)
                | (Processing, Cancelled)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn sources_for(next: JobStatus) -> Vec<JobStatus> {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(next))
        .collect()
    }

    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];
    pub const NON_TERMINAL: [JobStatus; 3] =
        [JobStatus::Pending, JobStatus::Processing, JobStatus::Paused];
}

/// Retry configuration for transient job failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        failsafe::backoff::exponential(self.base_delay, self.max_delay)
            .nth((attempt - 1) as usize)
            .unwrap_or(self.max_delay)
    }

    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// Why a job run did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Integration(IntegrationError),
    /// Store or queue failures inside the worker; treated as transient.
    Internal(String),
}

impl JobFailure {
    pub fn message(&self) -> String {
        match self {
            JobFailure::Integration(e) => e.to_string(),
            JobFailure::Internal(msg) => msg.clone(),
        }
    }
}

impl From<IntegrationError> for JobFailure {
    fn from(err: IntegrationError) -> Self {
        JobFailure::Integration(err)
    }
}

impl From<AppError> for JobFailure {
    fn from(err: AppError) -> Self {
        JobFailure::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        attempts: i32,
        delay: Duration,
        error: String,
    },
    Pause {
        service: ThirdPartyService,
        reason: String,
    },
    Fail {
        attempts: i32,
        error: String,
    },
}

/// Decides what happens to a PROCESSING job whose run failed.
pub fn decide_failure(job: &Job, failure: &JobFailure, policy: &RetryPolicy) -> FailureDecision {
    let attempts = job.attempts.saturating_add(1);
    let error = failure.message();

    if let JobFailure::Integration(IntegrationError::CircuitOpen { service }) = failure {
        return FailureDecision::Pause {
            service: *service,
            reason: error,
        };
    }

    let retryable = match failure {
        JobFailure::Integration(e) => e.is_retryable(),
        JobFailure::Internal(_) => true,
    };

    if retryable && policy.should_retry(attempts.max(0) as u32) {
        FailureDecision::Retry {
            attempts,
            delay: policy.delay_for_attempt(attempts.max(0) as u32),
            error,
        }
    } else {
        FailureDecision::Fail { attempts, error }
    }
}

// ============ Change builders ============

pub fn completed_change(result: String, now: DateTime<Utc>) -> JobStatusChange {
    JobStatusChange {
        result: Some(result),
        completed_at: Some(now),
        ..JobStatusChange::to(JobStatus::Completed)
    }
}

pub fn failed_change(error: String, attempts: Option<i32>, now: DateTime<Utc>) -> JobStatusChange {
    JobStatusChange {
        error: Some(error),
        attempts,
        completed_at: Some(now),
        ..JobStatusChange::to(JobStatus::Failed)
    }
}

pub fn retry_change(attempts: i32, error: String) -> JobStatusChange {
    JobStatusChange {
        error: Some(error),
        attempts: Some(attempts),
        ..JobStatusChange::to(JobStatus::Pending)
    }
}

pub fn paused_change(service: ThirdPartyService, reason: &str) -> JobStatusChange {
    JobStatusChange {
        error: Some(format!("Paused: {} unavailable ({})", service, reason)),
        paused_service: Some(service),
        ..JobStatusChange::to(JobStatus::Paused)
    }
}

/// Operator hold; `paused_service` stays empty so no breaker recovery resumes it.
pub fn held_change(reason: &str) -> JobStatusChange {
    JobStatusChange {
        error: Some(format!("Paused manually: {}", reason)),
        ..JobStatusChange::to(JobStatus::Paused)
    }
}

pub fn resumed_change() -> JobStatusChange {
    JobStatusChange::to(JobStatus::Pending)
}

pub fn cancelled_change(now: DateTime<Utc>) -> JobStatusChange {
    JobStatusChange {
        completed_at: Some(now),
        ..JobStatusChange::to(JobStatus::Cancelled)
    }
}
