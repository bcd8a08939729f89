use crate::models::ThirdPartyService;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Shared counter store (Redis) errors.
    CounterStoreError(String),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input, rejected synchronously).
    BadRequest(String),
    /// The requested transition conflicts with the entity's current state.
    Conflict(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// A third-party service is refused locally because its circuit is open.
    ServiceUnavailable(String),
    /// Required configuration is missing or malformed.
    Configuration(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::CounterStoreError(msg) => write!(f, "Counter store error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    /// Server-side failures are logged here; client errors are returned verbatim.
    fn into_response(self) -> Response {
        if let AppError::WithContext { source, context } = self {
            tracing::error!("{} -> {}", context, source);
            return source.into_response();
        }

        let (status, error_message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Refusing request, dependency unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::ExternalApiError(msg) => {
                tracing::error!("Third-party call failed: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Third-party service error".to_string(),
                )
            }
            other => {
                tracing::error!("{}", other);
                let public = match other {
                    AppError::DatabaseError(_) => "Database error",
                    AppError::CounterStoreError(_) => "Shared state unavailable",
                    AppError::Configuration(_) => "Service misconfigured",
                    _ => "Internal server error",
                };
                (StatusCode::INTERNAL_SERVER_ERROR, public.to_string())
            }
        };

        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CounterStoreError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("Serialization error: {}", err))
    }
}

/// Failure of a single third-party call, classified for retry and breaker accounting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrationError {
    /// Input is unusable; retrying cannot help.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The local rate limiter refused the call before it was made.
    #[error("{service} local rate limit exhausted")]
    Throttled { service: ThirdPartyService },
    /// The provider answered 429.
    #[error("{service} rate limited the request: {message}")]
    RateLimited {
        service: ThirdPartyService,
        message: String,
    },
    /// Timeouts, connection failures, 5xx and undecodable responses.
    #[error("{service} call failed: {message}")]
    Transient {
        service: ThirdPartyService,
        message: String,
    },
    /// 4xx other than 429.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: ThirdPartyService,
        message: String,
    },
    /// Refused locally because the service's breaker is open.
    #[error("circuit breaker for {service} is open")]
    CircuitOpen { service: ThirdPartyService },
}

impl IntegrationError {
    pub fn service(&self) -> Option<ThirdPartyService> {
        match self {
            IntegrationError::Validation(_) => None,
            IntegrationError::Throttled { service }
            | IntegrationError::RateLimited { service, .. }
            | IntegrationError::Transient { service, .. }
            | IntegrationError::Rejected { service, .. }
            | IntegrationError::CircuitOpen { service } => Some(*service),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntegrationError::Throttled { .. }
                | IntegrationError::RateLimited { .. }
                | IntegrationError::Transient { .. }
        )
    }

    /// Only genuine remote failures move the breaker; local refusals never do.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            IntegrationError::RateLimited { .. }
                | IntegrationError::Transient { .. }
                | IntegrationError::Rejected { .. }
        )
    }
}

impl From<IntegrationError> for AppError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::Validation(msg) => AppError::BadRequest(msg),
            IntegrationError::CircuitOpen { .. } | IntegrationError::Throttled { .. } => {
                AppError::ServiceUnavailable(err.to_string())
            }
            other => AppError::ExternalApiError(other.to_string()),
        }
    }
}

/// Attaches a context message to any error convertible into [`AppError`],
/// in the manner of `anyhow::Context`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Lazy variant; `f` only runs on error.
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<AppError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_display() {
        let err: Result<(), AppError> = Err(AppError::NotFound("campaign 42".to_string()));
        let err = err.context("loading campaign").unwrap_err();
        assert_eq!(err.to_string(), "loading campaign: Not found: campaign 42");
    }

    #[test]
    fn test_status_codes() {
        let resp = AppError::BadRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::Conflict("already running".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AppError::ServiceUnavailable("apollo open".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let wrapped = AppError::WithContext {
            source: Box::new(AppError::NotFound("job".into())),
            context: "cancel".into(),
        };
        assert_eq!(wrapped.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_integration_error_classification() {
        let service = ThirdPartyService::Apollo;
        let throttled = IntegrationError::Throttled { service };
        assert!(throttled.is_retryable());
        assert!(!throttled.counts_toward_breaker());

        let remote_429 = IntegrationError::RateLimited {
            service,
            message: "slow down".into(),
        };
        assert!(remote_429.is_retryable());
        assert!(remote_429.counts_toward_breaker());

        let rejected = IntegrationError::Rejected {
            service,
            message: "401".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.counts_toward_breaker());

        let open = IntegrationError::CircuitOpen { service };
        assert!(!open.is_retryable());
        assert!(!open.counts_toward_breaker());

        assert!(!IntegrationError::Validation("no company".into()).counts_toward_breaker());
    }
}
