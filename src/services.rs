//! HTTP clients for the third-party providers.
//!
//! Each client classifies failures into [`IntegrationError`] so the caller can
//! decide between retrying, pausing and failing. None of them consult the
//! breaker or rate limiter themselves; [`crate::service_guard::ServiceGuard`]
//! wraps every call.

use crate::config::Config;
use crate::enrichment::{build_email_copy_prompt, build_enrichment_prompt, validate_copy_inputs};
use crate::errors::{AppError, IntegrationError};
use crate::models::{Lead, ThirdPartyService};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const APOLLO_ACTOR_ID: &str = "code_crafter~apollo-io-scraper";
const PERPLEXITY_MODEL: &str = "sonar";
const OPENAI_MODEL: &str = "gpt-4";

/// Input of one scraper run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeQuery {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalRecords")]
    pub total_records: i32,
    pub url: String,
}

#[async_trait]
pub trait LeadScraper: Send + Sync {
    /// Raw dataset items produced by the scraper.
    async fn run(&self, query: &ScrapeQuery) -> Result<Vec<Value>, IntegrationError>;
}

#[async_trait]
pub trait LeadEnricher: Send + Sync {
    async fn enrich(&self, lead: &Lead) -> Result<Value, IntegrationError>;
}

#[async_trait]
pub trait EmailCopyGenerator: Send + Sync {
    /// Fails with `Validation` before any remote call when the lead lacks
    /// first name, last name or company.
    async fn generate(
        &self,
        lead: &Lead,
        enrichment: Option<&Value>,
    ) -> Result<Value, IntegrationError>;
}

#[async_trait]
pub trait EmailPlatform: Send + Sync {
    /// Returns the platform's campaign id.
    async fn create_campaign(&self, name: &str) -> Result<String, IntegrationError>;
    async fn push_lead(
        &self,
        external_campaign_id: &str,
        lead: &Lead,
        email_copy: Option<&Value>,
    ) -> Result<Value, IntegrationError>;
    async fn get_campaign_analytics(
        &self,
        external_campaign_id: &str,
    ) -> Result<Value, IntegrationError>;
}

// ============ Shared plumbing ============

fn http_client(service: ThirdPartyService) -> Result<Client, AppError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AppError::Configuration(format!("Failed to create {} client: {}", service, e)))
}

fn require_key(service: ThirdPartyService, key: &Option<String>, var: &str) -> Result<String, AppError> {
    key.clone().filter(|k| !k.trim().is_empty()).ok_or_else(|| {
        AppError::Configuration(format!("{} is not set; {} client unavailable", var, service))
    })
}

/// Maps an HTTP status onto the retry/breaker taxonomy.
pub fn classify_status(service: ThirdPartyService, status: StatusCode, body: &str) -> IntegrationError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));
    if status == StatusCode::TOO_MANY_REQUESTS {
        IntegrationError::RateLimited { service, message }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        IntegrationError::Transient { service, message }
    } else {
        IntegrationError::Rejected { service, message }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn send_error(service: ThirdPartyService, err: reqwest::Error) -> IntegrationError {
    IntegrationError::Transient {
        service,
        message: if err.is_timeout() {
            "request timed out".to_string()
        } else {
            format!("request failed: {}", err)
        },
    }
}

async fn check_response(
    service: ThirdPartyService,
    response: Response,
) -> Result<Response, IntegrationError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    tracing::error!("{} returned error {}: {}", service, status, truncate(&error_text, 300));
    Err(classify_status(service, status, &error_text))
}

async fn decode<T: serde::de::DeserializeOwned>(
    service: ThirdPartyService,
    response: Response,
) -> Result<T, IntegrationError> {
    response.json().await.map_err(|e| IntegrationError::Transient {
        service,
        message: format!("Failed to parse response: {}", e),
    })
}

// ============ Apollo (via Apify) ============

/// Runs the Apollo scraper actor on Apify and returns its dataset items.
pub struct ApolloService {
    client: Client,
    base_url: String,
    api_token: String,
}

impl ApolloService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let api_token = require_key(ThirdPartyService::Apollo, &config.apify_api_token, "APIFY_API_TOKEN")?;
        Ok(Self {
            client: http_client(ThirdPartyService::Apollo)?,
            base_url: config.apify_base_url.clone(),
            api_token,
        })
    }
}

#[async_trait]
impl LeadScraper for ApolloService {
    async fn run(&self, query: &ScrapeQuery) -> Result<Vec<Value>, IntegrationError> {
        let service = ThirdPartyService::Apollo;
        let url = format!(
            "{}/v2/acts/{}/run-sync-get-dataset-items",
            self.base_url, APOLLO_ACTOR_ID
        );
        tracing::info!(
            "Running Apollo scraper for {} records ({})",
            query.total_records,
            query.file_name
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(query)
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        let items: Vec<Value> = decode(service, response).await?;

        tracing::info!("✓ Apollo scraper returned {} records", items.len());
        Ok(items)
    }
}

// ============ Perplexity ============

pub struct PerplexityService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PerplexityService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let api_key = require_key(
            ThirdPartyService::Perplexity,
            &config.perplexity_api_key,
            "PERPLEXITY_API_KEY",
        )?;
        Ok(Self {
            client: http_client(ThirdPartyService::Perplexity)?,
            base_url: config.perplexity_base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl LeadEnricher for PerplexityService {
    async fn enrich(&self, lead: &Lead) -> Result<Value, IntegrationError> {
        let service = ThirdPartyService::Perplexity;
        let body = json!({
            "model": PERPLEXITY_MODEL,
            "messages": [
                {"role": "system", "content": "You are a B2B research assistant."},
                {"role": "user", "content": build_enrichment_prompt(lead)}
            ]
        });

        tracing::debug!("Enriching lead {} via Perplexity", lead.id);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        decode(service, response).await
    }
}

// ============ OpenAI ============

pub struct OpenAiService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let api_key = require_key(ThirdPartyService::OpenAi, &config.openai_api_key, "OPENAI_API_KEY")?;
        Ok(Self {
            client: http_client(ThirdPartyService::OpenAi)?,
            base_url: config.openai_base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl EmailCopyGenerator for OpenAiService {
    async fn generate(
        &self,
        lead: &Lead,
        enrichment: Option<&Value>,
    ) -> Result<Value, IntegrationError> {
        validate_copy_inputs(lead)?;

        let service = ThirdPartyService::OpenAi;
        let body = json!({
            "model": OPENAI_MODEL,
            "messages": [
                {"role": "system", "content": "You are a professional email copywriter."},
                {"role": "user", "content": build_email_copy_prompt(lead, enrichment)}
            ],
            "temperature": 0.7,
            "max_tokens": 500
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        let result = decode(service, response).await?;
        tracing::info!("✓ Email copy generated for lead {}", lead.id);
        Ok(result)
    }
}

// ============ Instantly ============

#[derive(Debug, Deserialize)]
struct InstantlyCampaign {
    id: String,
}

pub struct InstantlyService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl InstantlyService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let api_key = require_key(
            ThirdPartyService::Instantly,
            &config.instantly_api_key,
            "INSTANTLY_API_KEY",
        )?;
        Ok(Self {
            client: http_client(ThirdPartyService::Instantly)?,
            base_url: config.instantly_base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl EmailPlatform for InstantlyService {
    async fn create_campaign(&self, name: &str) -> Result<String, IntegrationError> {
        let service = ThirdPartyService::Instantly;
        let body = json!({
            "name": name,
            "campaign_schedule": {
                "schedules": [{
                    "name": "Default",
                    "timing": {"from": "09:00", "to": "17:00"},
                    "days": {"1": true, "2": true, "3": true, "4": true, "5": true},
                    "timezone": "America/Chicago"
                }]
            }
        });

        let response = self
            .client
            .post(format!("{}/api/v2/campaigns", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        let campaign: InstantlyCampaign = decode(service, response).await?;
        tracing::info!("✓ Instantly campaign created: {}", campaign.id);
        Ok(campaign.id)
    }

    async fn push_lead(
        &self,
        external_campaign_id: &str,
        lead: &Lead,
        email_copy: Option<&Value>,
    ) -> Result<Value, IntegrationError> {
        let service = ThirdPartyService::Instantly;
        let email = lead
            .email
            .as_deref()
            .ok_or_else(|| IntegrationError::Validation(format!("Lead {} has no email", lead.id)))?;
        let personalization = email_copy
            .and_then(crate::enrichment::message_content)
            .unwrap_or_default();

        let body = json!({
            "campaign": external_campaign_id,
            "email": email,
            "first_name": lead.first_name,
            "last_name": lead.last_name,
            "company_name": lead.company,
            "personalization": personalization,
        });

        let response = self
            .client
            .post(format!("{}/api/v2/leads", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        decode(service, response).await
    }

    async fn get_campaign_analytics(
        &self,
        external_campaign_id: &str,
    ) -> Result<Value, IntegrationError> {
        let service = ThirdPartyService::Instantly;
        let response = self
            .client
            .get(format!("{}/api/v2/campaigns/analytics", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("id", external_campaign_id)])
            .send()
            .await
            .map_err(|e| send_error(service, e))?;
        let response = check_response(service, response).await?;
        decode(service, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let s = ThirdPartyService::Perplexity;
        assert!(matches!(
            classify_status(s, StatusCode::TOO_MANY_REQUESTS, ""),
            IntegrationError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(s, StatusCode::BAD_GATEWAY, "upstream"),
            IntegrationError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(s, StatusCode::REQUEST_TIMEOUT, ""),
            IntegrationError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(s, StatusCode::UNAUTHORIZED, "bad key"),
            IntegrationError::Rejected { .. }
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ação", 2), "aç");
        assert_eq!(truncate("short", 300), "short");
    }

    #[test]
    fn test_scrape_query_wire_names() {
        let query = ScrapeQuery {
            file_name: "x.csv".into(),
            total_records: 5,
            url: "https://app.apollo.io/#/people".into(),
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["fileName"], "x.csv");
        assert_eq!(value["totalRecords"], 5);
    }
}
