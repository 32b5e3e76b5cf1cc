use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::store::{Conflict, NewLead, Store, StoreError};

/// Public lead form payload. `honeypot` is a hidden field real users
/// never fill; `website` is the alias the static form templates use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadSubmission {
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub custom_fields: Option<Value>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub utm_term: Option<String>,
    #[serde(default)]
    pub utm_content: Option<String>,
    #[serde(default, alias = "website")]
    pub honeypot: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
}

/// Request context captured from headers by the HTTP layer. Country is
/// coarse geolocation only; raw client addresses are never stored.
#[derive(Debug, Clone, Default)]
pub struct LeadContext {
    pub user_agent: Option<String>,
    pub ip_country: Option<String>,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadOutcome {
    pub lead_id: i64,
    pub experiment_id: String,
    pub slug: String,
}

#[derive(Debug, Error)]
pub enum LeadIntakeError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("custom_fields must be a JSON object")]
    InvalidCustomFields,
    #[error("experiment not found")]
    ExperimentNotFound,
    #[error("a lead with this email already exists for this experiment")]
    DuplicateLead,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LeadIntakeError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(Conflict::LeadEmail) => Self::DuplicateLead,
            other => Self::Store(other),
        }
    }
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Turn a form submission into a lead row, or discard it quietly when
/// the honeypot fires. The honeypot check runs after the experiment
/// gate so probes against unknown experiment ids still see the same
/// 404 a human would, but before any write.
pub fn submit_lead(
    store: &Store,
    submission: LeadSubmission,
    context: LeadContext,
) -> Result<LeadOutcome, LeadIntakeError> {
    let experiment_id = submission
        .experiment_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(LeadIntakeError::MissingField("experiment_id"))?
        .to_string();
    let raw_email = submission
        .email
        .as_deref()
        .filter(|email| !email.trim().is_empty())
        .ok_or(LeadIntakeError::MissingField("email"))?;

    let experiment = store
        .get_experiment(&experiment_id)?
        .filter(|record| record.status.accepts_leads())
        .ok_or(LeadIntakeError::ExperimentNotFound)?;

    if submission
        .honeypot
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty())
    {
        // Bot: answer exactly like a success, persist nothing. The
        // decoy id is random per attempt, so retries get fresh ids.
        let decoy_id = rand::rng().random_range(1_000..100_000_000_i64);
        return Ok(LeadOutcome {
            lead_id: decoy_id,
            experiment_id,
            slug: experiment.slug,
        });
    }

    let email = normalize_email(raw_email);

    if let Some(custom_fields) = &submission.custom_fields {
        if !custom_fields.is_object() {
            return Err(LeadIntakeError::InvalidCustomFields);
        }
    }

    let lead = store.insert_lead(NewLead {
        experiment_id: experiment_id.clone(),
        email,
        name: submission.name,
        company: submission.company,
        phone: submission.phone,
        custom_fields: submission.custom_fields,
        utm_source: submission.utm_source,
        utm_medium: submission.utm_medium,
        utm_campaign: submission.utm_campaign,
        utm_term: submission.utm_term,
        utm_content: submission.utm_content,
        // Body attribution wins; the Referer header is the fallback.
        referrer: submission.referrer.or(context.referrer),
        session_id: submission.session_id,
        visitor_id: submission.visitor_id,
        ip_country: context.ip_country,
        user_agent: context.user_agent,
    })?;

    Ok(LeadOutcome {
        lead_id: lead.id,
        experiment_id,
        slug: experiment.slug,
    })
}
