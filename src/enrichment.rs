//! Lead-level helpers shared by the pipeline stages:
//!
//! 1. Parse scraper records into leads with a stable de-duplication key
//! 2. Filter unusable emails before any paid call
//! 3. Build the enrichment and email-copy prompts
use crate::errors::IntegrationError;
use crate::models::{Lead, NewLead};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits, sample domains)
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let lowered = email.to_lowercase();
    let fake_patterns = [
        "999999",
        "111111",
        "000000",
        "123456789",
        "@example.",
        "noreply@",
        "no-reply@",
        "email_not_unlocked",
    ];
    for pattern in &fake_patterns {
        if lowered.contains(pattern) {
            tracing::warn!(
                "❌ Invalid email detected (placeholder pattern '{}'): {}",
                pattern,
                email
            );
            return false;
        }
    }

    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    let email_regex = EMAIL_RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    });

    if !email_regex.is_match(email) {
        tracing::warn!("❌ Invalid email format: {}", email);
        return false;
    }

    true
}

fn normalized(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// SHA-256 over the strongest identity the lead has: email, then LinkedIn
/// URL, then name plus company. `None` when the record carries none of them.
pub fn dedupe_key(
    email: Option<&str>,
    linkedin_url: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
    company: Option<&str>,
) -> Option<String> {
    let identity = if let Some(email) = normalized(email) {
        format!("email:{}", email)
    } else if let Some(linkedin) = normalized(linkedin_url) {
        format!("linkedin:{}", linkedin.trim_end_matches('/'))
    } else {
        let first = normalized(first_name);
        let last = normalized(last_name);
        let company = normalized(company);
        if first.is_none() && last.is_none() {
            return None;
        }
        format!(
            "name:{}|{}|{}",
            first.unwrap_or_default(),
            last.unwrap_or_default(),
            company.unwrap_or_default()
        )
    };

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

fn string_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| {
            let mut current = record;
            for part in key.split('.') {
                current = current.get(part)?;
            }
            current.as_str()
        })
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Maps one scraper dataset item onto a lead. Items without any usable
/// identity are skipped (`None`).
pub fn lead_from_record(record: &Value) -> Option<NewLead> {
    let first_name = string_field(record, &["first_name", "firstName"]);
    let last_name = string_field(record, &["last_name", "lastName"]);
    let email = string_field(record, &["email"]);
    let company = string_field(
        record,
        &["organization_name", "organization.name", "company_name", "company"],
    );
    let title = string_field(record, &["title", "headline"]);
    let linkedin_url = string_field(record, &["linkedin_url", "linkedinUrl"]);

    let key = dedupe_key(
        email.as_deref(),
        linkedin_url.as_deref(),
        first_name.as_deref(),
        last_name.as_deref(),
        company.as_deref(),
    )?;

    Some(NewLead {
        first_name,
        last_name,
        email,
        company,
        title,
        linkedin_url,
        dedupe_key: key,
        raw_data: record.clone(),
    })
}

/// Leads from a dataset, dropping unidentifiable items and in-batch duplicates.
pub fn leads_from_dataset(records: &[Value]) -> Vec<NewLead> {
    let mut seen = std::collections::HashSet::new();
    let mut leads = Vec::with_capacity(records.len());
    for record in records {
        match lead_from_record(record) {
            Some(lead) => {
                if seen.insert(lead.dedupe_key.clone()) {
                    leads.push(lead);
                }
            }
            None => tracing::debug!("Skipping scraper record without identity"),
        }
    }
    leads
}

/// The lead's email when it passes the local check.
pub fn usable_email(lead: &Lead) -> Option<&str> {
    lead.email.as_deref().filter(|e| is_valid_email(e))
}

fn full_name(lead: &Lead) -> String {
    format!(
        "{} {}",
        lead.first_name.as_deref().unwrap_or_default(),
        lead.last_name.as_deref().unwrap_or_default()
    )
    .trim()
    .to_string()
}

/// Email copy needs first name, last name and company; checked before the remote call.
pub fn validate_copy_inputs(lead: &Lead) -> Result<(), IntegrationError> {
    let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    let mut missing = Vec::new();
    if blank(&lead.first_name) {
        missing.push("first_name");
    }
    if blank(&lead.last_name) {
        missing.push("last_name");
    }
    if blank(&lead.company) {
        missing.push("company_name");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IntegrationError::Validation(format!(
            "Missing required prompt variables for email copy: {} for lead {}",
            missing.join(", "),
            lead.id
        )))
    }
}

/// First choice's message text in a chat-completions style response.
pub fn message_content(response: &Value) -> Option<&str> {
    response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

pub fn build_enrichment_prompt(lead: &Lead) -> String {
    format!(
        "Research {} ({}) at {}. Summarize the company's business, recent news, \
         and likely priorities for someone in this role. Be factual and concise.",
        full_name(lead),
        lead.title.as_deref().unwrap_or("Unknown role"),
        lead.company.as_deref().unwrap_or("an unknown company"),
    )
}

pub fn build_email_copy_prompt(lead: &Lead, enrichment: Option<&Value>) -> String {
    let enrichment_content = enrichment.and_then(message_content).unwrap_or_default();
    let name = full_name(lead);
    let company = lead.company.as_deref().unwrap_or_default();
    format!(
        "Write a personalized email to {name} at {company}.\n\n\
         Enrichment Information:\n{enrichment_content}\n\n\
         Lead Information:\n\
         - Name: {name}\n\
         - Company: {company}\n\
         - Role: {role}\n\n\
         Write a professional, personalized email that:\n\
         1. Shows understanding of their business\n\
         2. Offers specific value\n\
         3. Has a clear call to action\n\
         4. Is concise and engaging\n\n\
         Email:",
        role = lead.title.as_deref().unwrap_or("Unknown"),
    )
}
