use crate::job_lifecycle::RetryPolicy;
use crate::models::ThirdPartyService;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Quota for one third-party service: `max_requests` per `period_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub period_seconds: u64,
}

impl RateLimit {
    pub const fn new(max_requests: u32, period_seconds: u64) -> Self {
        Self {
            max_requests,
            period_seconds,
        }
    }

    /// Parses the `max/period_seconds` form used by the `<SERVICE>_RATE_LIMIT` variables.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (max, period) = raw
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("rate limit '{}' must look like 30/60", raw))?;
        let max_requests: u32 = max
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("rate limit '{}' has an invalid request count", raw))?;
        let period_seconds: u64 = period
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("rate limit '{}' has an invalid period", raw))?;
        if max_requests == 0 || period_seconds == 0 {
            anyhow::bail!("rate limit '{}' must be positive on both sides", raw);
        }
        Ok(Self::new(max_requests, period_seconds))
    }

    fn default_for(service: ThirdPartyService) -> Self {
        match service {
            ThirdPartyService::Apollo => Self::new(30, 60),
            ThirdPartyService::OpenAi => Self::new(60, 60),
            ThirdPartyService::Perplexity => Self::new(50, 60),
            ThirdPartyService::Instantly => Self::new(100, 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,

    pub apify_api_token: Option<String>,
    pub apify_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub perplexity_api_key: Option<String>,
    pub perplexity_base_url: String,
    pub instantly_api_key: Option<String>,
    pub instantly_base_url: String,

    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    pub circuit_half_open_max_calls: u32,
    pub rate_limits: HashMap<ThirdPartyService, RateLimit>,

    pub job_max_attempts: u32,
    pub job_retry_base_secs: u64,
    pub job_retry_max_secs: u64,
    pub worker_concurrency: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut rate_limits = HashMap::new();
        for service in ThirdPartyService::ALL {
            let var = format!("{}_RATE_LIMIT", service.as_str().to_uppercase());
            let limit = match std::env::var(&var) {
                Ok(raw) if !raw.trim().is_empty() => RateLimit::parse(&raw)
                    .map_err(|e| anyhow::anyhow!("{} is invalid: {}", var, e))?,
                _ => RateLimit::default_for(service),
            };
            rate_limits.insert(service, limit);
        }

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            redis_url: std::env::var("REDIS_URL")
                .map_err(|_| anyhow::anyhow!("REDIS_URL environment variable required"))
                .and_then(|url| {
                    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                        anyhow::bail!("REDIS_URL must start with redis:// or rediss://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,

            apify_api_token: optional_secret("APIFY_API_TOKEN"),
            apify_base_url: base_url("APIFY_BASE_URL", "https://api.apify.com")?,
            openai_api_key: optional_secret("OPENAI_API_KEY"),
            openai_base_url: base_url("OPENAI_BASE_URL", "https://api.openai.com")?,
            perplexity_api_key: optional_secret("PERPLEXITY_API_KEY"),
            perplexity_base_url: base_url("PERPLEXITY_BASE_URL", "https://api.perplexity.ai")?,
            instantly_api_key: optional_secret("INSTANTLY_API_KEY"),
            instantly_base_url: base_url("INSTANTLY_BASE_URL", "https://api.instantly.ai")?,

            circuit_failure_threshold: positive_number("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_cooldown_secs: positive_number("CIRCUIT_COOLDOWN_SECS", 60)?,
            circuit_half_open_max_calls: positive_number("CIRCUIT_HALF_OPEN_MAX_CALLS", 1)?,
            rate_limits,

            job_max_attempts: positive_number("JOB_MAX_ATTEMPTS", 3)?,
            job_retry_base_secs: positive_number("JOB_RETRY_BASE_SECS", 10)?,
            job_retry_max_secs: positive_number("JOB_RETRY_MAX_SECS", 300)?,
            worker_concurrency: positive_number("WORKER_CONCURRENCY", 4)?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Apify Base URL: {}", config.apify_base_url);
        tracing::debug!("OpenAI Base URL: {}", config.openai_base_url);
        tracing::debug!("Perplexity Base URL: {}", config.perplexity_base_url);
        tracing::debug!("Instantly Base URL: {}", config.instantly_base_url);
        tracing::debug!(
            "Circuit breaker: threshold={}, cooldown={}s, half-open probes={}",
            config.circuit_failure_threshold,
            config.circuit_cooldown_secs,
            config.circuit_half_open_max_calls
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn rate_limit(&self, service: ThirdPartyService) -> RateLimit {
        self.rate_limits
            .get(&service)
            .copied()
            .unwrap_or_else(|| RateLimit::default_for(service))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.job_max_attempts,
            Duration::from_secs(self.job_retry_base_secs),
            Duration::from_secs(self.job_retry_max_secs),
        )
    }
}

fn optional_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.trim().is_empty())
}

fn base_url(var: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(var)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", var);
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn positive_number<T>(var: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
{
    let value = match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a number", var))?,
        _ => default,
    };
    if value <= T::default() {
        anyhow::bail!("{} must be greater than 0", var);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_parse() {
        assert_eq!(RateLimit::parse("30/60").unwrap(), RateLimit::new(30, 60));
        assert_eq!(RateLimit::parse(" 1 / 5 ").unwrap(), RateLimit::new(1, 5));
        assert!(RateLimit::parse("30").is_err());
        assert!(RateLimit::parse("0/60").is_err());
        assert!(RateLimit::parse("ten/60").is_err());
    }

    #[test]
    fn test_default_limits_cover_every_service() {
        for service in ThirdPartyService::ALL {
            let limit = RateLimit::default_for(service);
            assert!(limit.max_requests > 0);
            assert!(limit.period_seconds > 0);
        }
    }
}
