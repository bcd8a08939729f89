//! Redis implementations of the shared-state seams.
//!
//! Every read-modify-write runs as a Lua script so concurrent workers observe
//! each breaker transition and counter increment exactly once.

use crate::circuit_breaker::{BreakerSettings, BreakerStore, CallDecision, FailureOutcome};
use crate::clock::Clock;
use crate::errors::{AppError, ResultExt};
use crate::models::{CircuitBreakerRecord, CircuitState, ThirdPartyService};
use crate::rate_limiter::CounterStore;
use crate::task_queue::{TaskEnvelope, TaskQueue};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub async fn connect(redis_url: &str) -> Result<ConnectionManager, AppError> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    tracing::info!("✓ Connected to Redis");
    Ok(manager)
}

pub async fn ping(conn: &ConnectionManager) -> Result<(), AppError> {
    let mut conn = conn.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("Redis ping failed")?;
    Ok(())
}

mod scripts {
    use redis::Script;

    /// KEYS[1] breaker hash; ARGV reason, threshold, now_ms. Returns {count, opened}.
    pub fn record_failure() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local threshold = tonumber(ARGV[2])
            local state = redis.call('HGET', key, 'state') or 'closed'
            local count = redis.call('HINCRBY', key, 'failure_count', 1)
            redis.call('HSET', key, 'failure_threshold', threshold)

            if (state == 'closed' and count >= threshold) or state == 'half_open' then
                redis.call('HSET', key,
                    'state', 'open',
                    'opened_at', ARGV[3],
                    'pause_info', ARGV[1],
                    'half_open_calls', 0)
                redis.call('HDEL', key, 'half_open_at')
                return {count, 1}
            end

            redis.call('HSETNX', key, 'state', 'closed')
            return {count, 0}
            "#,
        )
    }

    /// KEYS[1] breaker hash. Returns 1 when a half-open breaker closed.
    pub fn record_success() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local state = redis.call('HGET', key, 'state')
            if state == 'half_open' then
                redis.call('HSET', key,
                    'state', 'closed',
                    'failure_count', 0,
                    'half_open_calls', 0,
                    'manual_override', 0)
                redis.call('HDEL', key, 'opened_at', 'half_open_at', 'pause_info')
                return 1
            elseif state == 'closed' then
                redis.call('HSET', key, 'failure_count', 0)
            end
            return 0
            "#,
        )
    }

    /// KEYS[1] breaker hash; ARGV now_ms, cooldown_ms, max_half_open_calls.
    /// Returns {allowed, entered_half_open, probe}.
    pub fn try_acquire() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local cooldown = tonumber(ARGV[2])
            local max_calls = tonumber(ARGV[3])
            local state = redis.call('HGET', key, 'state')

            if not state or state == 'closed' then
                return {1, 0, 0}
            end

            if state == 'open' then
                if redis.call('HGET', key, 'manual_override') == '1' then
                    return {0, 0, 0}
                end
                local opened_at = tonumber(redis.call('HGET', key, 'opened_at') or '0')
                if opened_at + cooldown > now then
                    return {0, 0, 0}
                end
                redis.call('HSET', key, 'state', 'half_open', 'half_open_at', now, 'half_open_calls', 1)
                return {1, 1, 1}
            end

            local since = tonumber(redis.call('HGET', key, 'half_open_at') or '0')
            if since + cooldown <= now then
                redis.call('HSET', key, 'half_open_at', now, 'half_open_calls', 1)
                return {1, 0, 1}
            end
            local calls = tonumber(redis.call('HGET', key, 'half_open_calls') or '0')
            if calls < max_calls then
                redis.call('HINCRBY', key, 'half_open_calls', 1)
                return {1, 0, 1}
            end
            return {0, 0, 0}
            "#,
        )
    }

    /// KEYS[1] breaker hash. Returns 1 when a HALF_OPEN slot was handed back.
    pub fn release_probe() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            if redis.call('HGET', key, 'state') ~= 'half_open' then
                return 0
            end
            local calls = tonumber(redis.call('HGET', key, 'half_open_calls') or '0')
            if calls <= 0 then
                return 0
            end
            redis.call('HINCRBY', key, 'half_open_calls', -1)
            return 1
            "#,
        )
    }

    /// KEYS[1] breaker hash; ARGV reason, threshold, now_ms.
    pub fn force_open() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            redis.call('HSET', key,
                'state', 'open',
                'pause_info', ARGV[1],
                'failure_threshold', ARGV[2],
                'opened_at', ARGV[3],
                'manual_override', 1,
                'half_open_calls', 0)
            redis.call('HSETNX', key, 'failure_count', 0)
            redis.call('HDEL', key, 'half_open_at')
            return 1
            "#,
        )
    }

    /// KEYS[1] breaker hash; ARGV threshold.
    pub fn force_close() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            redis.call('HSET', key,
                'state', 'closed',
                'failure_count', 0,
                'failure_threshold', ARGV[1],
                'manual_override', 0,
                'half_open_calls', 0)
            redis.call('HDEL', key, 'opened_at', 'half_open_at', 'pause_info')
            return 1
            "#,
        )
    }

    /// KEYS[1] sorted set; ARGV now_ms, window_ms, limit, member.
    pub fn sliding_window_log() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])

            redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
            local current = redis.call('ZCARD', key)
            if current < limit then
                redis.call('ZADD', key, now, ARGV[4])
                redis.call('PEXPIRE', key, window)
                return 1
            end
            return 0
            "#,
        )
    }

    /// KEYS[1] ready list, KEYS[2] delayed set; ARGV now_ms.
    pub fn promote_due() -> Script {
        Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
            for _, task in ipairs(due) do
                redis.call('ZREM', KEYS[2], task)
                redis.call('LPUSH', KEYS[1], task)
            end
            return #due
            "#,
        )
    }
}

// ============ Circuit breaker state ============

pub struct RedisBreakerStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisBreakerStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: "circuit_breaker".to_string(),
        }
    }

    fn key(&self, service: ThirdPartyService) -> String {
        format!("{}:{}", self.key_prefix, service.as_str())
    }
}

fn millis_to_time(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn parse_record(
    service: ThirdPartyService,
    threshold: u32,
    fields: &HashMap<String, String>,
) -> CircuitBreakerRecord {
    let number = |name: &str| fields.get(name).and_then(|v| v.parse::<u32>().ok());
    CircuitBreakerRecord {
        service,
        state: fields
            .get("state")
            .and_then(|s| CircuitState::parse(s))
            .unwrap_or(CircuitState::Closed),
        failure_count: number("failure_count").unwrap_or(0),
        failure_threshold: number("failure_threshold").unwrap_or(threshold),
        opened_at: millis_to_time(fields.get("opened_at")),
        half_open_at: millis_to_time(fields.get("half_open_at")),
        half_open_calls: number("half_open_calls").unwrap_or(0),
        pause_info: fields.get("pause_info").cloned(),
        manual_override: fields.get("manual_override").map(|v| v == "1").unwrap_or(false),
    }
}

#[async_trait]
impl BreakerStore for RedisBreakerStore {
    async fn load(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(service))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to load breaker state for {}", service))?;
        Ok(parse_record(service, threshold, &fields))
    }

    async fn record_failure(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AppError> {
        let mut conn = self.conn.clone();
        let result: Vec<i64> = scripts::record_failure()
            .key(self.key(service))
            .arg(reason)
            .arg(threshold)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to record failure for {}", service))?;
        Ok(FailureOutcome {
            failure_count: result.first().copied().unwrap_or(0).max(0) as u32,
            opened: result.get(1).copied().unwrap_or(0) == 1,
        })
    }

    async fn record_success(&self, service: ThirdPartyService) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let closed: i64 = scripts::record_success()
            .key(self.key(service))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to record success for {}", service))?;
        Ok(closed == 1)
    }

    async fn try_acquire(
        &self,
        service: ThirdPartyService,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<CallDecision, AppError> {
        let mut conn = self.conn.clone();
        let result: Vec<i64> = scripts::try_acquire()
            .key(self.key(service))
            .arg(now.timestamp_millis())
            .arg(settings.cooldown_millis())
            .arg(settings.half_open_max_calls)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to check breaker for {}", service))?;
        Ok(CallDecision {
            allowed: result.first().copied().unwrap_or(1) == 1,
            entered_half_open: result.get(1).copied().unwrap_or(0) == 1,
            probe: result.get(2).copied().unwrap_or(0) == 1,
        })
    }

    async fn release_probe(&self, service: ThirdPartyService) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let released: i64 = scripts::release_probe()
            .key(self.key(service))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to release probe for {}", service))?;
        Ok(released == 1)
    }

    async fn force_open(
        &self,
        service: ThirdPartyService,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = scripts::force_open()
            .key(self.key(service))
            .arg(reason)
            .arg(threshold)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to pause {}", service))?;
        self.load(service, threshold).await
    }

    async fn force_close(
        &self,
        service: ThirdPartyService,
        threshold: u32,
    ) -> Result<CircuitBreakerRecord, AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = scripts::force_close()
            .key(self.key(service))
            .arg(threshold)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to resume {}", service))?;
        self.load(service, threshold).await
    }
}

// ============ Rate limit counters ============

pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn try_acquire(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        // Unique member so requests in the same millisecond are all counted.
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let allowed: i64 = scripts::sliding_window_log()
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(max)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Rate limit check failed for {}", key))?;
        Ok(allowed == 1)
    }

    async fn remaining(
        &self,
        key: &str,
        max: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<u32, AppError> {
        let mut conn = self.conn.clone();
        let used: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", now_ms - window_ms))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Rate limit lookup failed for {}", key))?;
        Ok(max.saturating_sub(used.min(u64::from(u32::MAX)) as u32))
    }
}

// ============ Task queue ============

pub struct RedisTaskQueue {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
    ready_key: String,
    delayed_key: String,
    revoked_key: String,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            clock,
            ready_key: "leadgen:tasks:ready".to_string(),
            delayed_key: "leadgen:tasks:delayed".to_string(),
            revoked_key: "leadgen:tasks:revoked".to_string(),
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task_name: &str, payload: Value) -> Result<String, AppError> {
        let task = TaskEnvelope::new(task_name, payload, self.clock.now());
        let body = serde_json::to_string(&task)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.ready_key)
            .arg(body)
            .query_async(&mut conn)
            .await
            .context("Failed to enqueue task")?;
        Ok(task.handle)
    }

    async fn enqueue_after(
        &self,
        task_name: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<String, AppError> {
        let now = self.clock.now();
        let task = TaskEnvelope::new(task_name, payload, now);
        let body = serde_json::to_string(&task)?;
        let due = now.timestamp_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(body)
            .query_async(&mut conn)
            .await
            .context("Failed to schedule task")?;
        Ok(task.handle)
    }

    async fn dequeue(&self) -> Result<Option<TaskEnvelope>, AppError> {
        let mut conn = self.conn.clone();
        let promoted: i64 = scripts::promote_due()
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .arg(self.clock.now_millis())
            .invoke_async(&mut conn)
            .await
            .context("Failed to promote delayed tasks")?;
        if promoted > 0 {
            tracing::debug!("Promoted {} delayed tasks", promoted);
        }

        loop {
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(&self.ready_key)
                .query_async(&mut conn)
                .await
                .context("Failed to pop task")?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let task: TaskEnvelope = match serde_json::from_str(&raw) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!("Dropping undecodable task: {}", e);
                    continue;
                }
            };
            let revoked: i64 = redis::cmd("SREM")
                .arg(&self.revoked_key)
                .arg(&task.handle)
                .query_async(&mut conn)
                .await
                .context("Failed to check task revocation")?;
            if revoked == 1 {
                tracing::debug!(handle = %task.handle, "Dropping revoked task");
                continue;
            }
            return Ok(Some(task));
        }
    }

    async fn revoke(&self, handle: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(&self.revoked_key)
            .arg(handle)
            .query_async(&mut conn)
            .await
            .context("Failed to revoke task")?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        let ready: u64 = redis::cmd("LLEN")
            .arg(&self.ready_key)
            .query_async(&mut conn)
            .await
            .context("Failed to read queue length")?;
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(&self.delayed_key)
            .query_async(&mut conn)
            .await
            .context("Failed to read delayed queue length")?;
        Ok(ready + delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_defaults_to_closed() {
        let record = parse_record(ThirdPartyService::Apollo, 5, &HashMap::new());
        assert_eq!(record, CircuitBreakerRecord::closed(ThirdPartyService::Apollo, 5));
    }

    #[test]
    fn test_parse_record_reads_fields() {
        let now = Utc::now();
        let fields: HashMap<String, String> = [
            ("state", "open".to_string()),
            ("failure_count", "7".to_string()),
            ("failure_threshold", "5".to_string()),
            ("opened_at", now.timestamp_millis().to_string()),
            ("pause_info", "HTTP 503".to_string()),
            ("manual_override", "1".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let record = parse_record(ThirdPartyService::OpenAi, 3, &fields);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.failure_count, 7);
        assert_eq!(record.failure_threshold, 5);
        assert_eq!(
            record.opened_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert!(record.manual_override);
    }
}
