//! Asynchronous task queue the worker pool consumes.
//!
//! Tasks carry a job id; the job row is the source of truth. Revoking a task
//! makes `dequeue` skip it, it does not interrupt a task already running.

use crate::clock::Clock;
use crate::errors::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub handle: String,
    pub task_name: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task_name: &str, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            handle: Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            payload,
            enqueued_at: now,
        }
    }
}

/// Payload of every pipeline task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTaskPayload {
    pub job_id: Uuid,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns the task handle.
    async fn enqueue(&self, task_name: &str, payload: Value) -> Result<String, AppError>;

    /// Makes the task visible to `dequeue` only after `delay`.
    async fn enqueue_after(
        &self,
        task_name: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<String, AppError>;

    /// Next ready task, or `None` when nothing is due. Revoked tasks are dropped.
    async fn dequeue(&self) -> Result<Option<TaskEnvelope>, AppError>;

    async fn revoke(&self, handle: &str) -> Result<(), AppError>;

    /// Ready plus delayed tasks.
    async fn depth(&self) -> Result<u64, AppError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskEnvelope>,
    delayed: Vec<(DateTime<Utc>, TaskEnvelope)>,
    revoked: HashSet<String>,
}

pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }

    /// Handles of every queued task, ready first. Test helper.
    pub async fn queued_handles(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .ready
            .iter()
            .map(|t| t.handle.clone())
            .chain(state.delayed.iter().map(|(_, t)| t.handle.clone()))
            .collect()
    }

    pub async fn is_revoked(&self, handle: &str) -> bool {
        self.state.lock().await.revoked.contains(handle)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task_name: &str, payload: Value) -> Result<String, AppError> {
        let task = TaskEnvelope::new(task_name, payload, self.clock.now());
        let handle = task.handle.clone();
        self.state.lock().await.ready.push_back(task);
        Ok(handle)
    }

    async fn enqueue_after(
        &self,
        task_name: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<String, AppError> {
        let now = self.clock.now();
        let task = TaskEnvelope::new(task_name, payload, now);
        let handle = task.handle.clone();
        let due = now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
        self.state.lock().await.delayed.push((due, task));
        Ok(handle)
    }

    async fn dequeue(&self) -> Result<Option<TaskEnvelope>, AppError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        let mut due = due;
        due.sort_by_key(|(at, _)| *at);
        state.ready.extend(due.into_iter().map(|(_, task)| task));

        while let Some(task) = state.ready.pop_front() {
            if state.revoked.remove(&task.handle) {
                tracing::debug!(handle = %task.handle, "Dropping revoked task");
                continue;
            }
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn revoke(&self, handle: &str) -> Result<(), AppError> {
        self.state.lock().await.revoked.insert(handle.to_string());
        Ok(())
    }

    async fn depth(&self) -> Result<u64, AppError> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.delayed.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn test_fifo_and_revocation() {
        let queue = InMemoryTaskQueue::new(Arc::new(ManualClock::default()));
        let first = queue.enqueue("fetch_leads", json!({"n": 1})).await.unwrap();
        let second = queue.enqueue("fetch_leads", json!({"n": 2})).await.unwrap();
        queue.revoke(&first).await.unwrap();

        let task = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(task.handle, second);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_tasks_wait_for_clock() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryTaskQueue::new(clock.clone());
        queue
            .enqueue_after("enrich_lead", json!({}), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        assert!(queue.dequeue().await.unwrap().is_some());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
