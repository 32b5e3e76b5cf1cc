use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::store::{NewEvent, Store, StoreError};

/// Incoming tracking event as posted by a landing page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSubmission {
    #[serde(default)]
    pub experiment_id: Option<String>,
    // Defaulted so an absent field reaches the handler's emptiness
    // check instead of a bare extractor rejection.
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_data: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOutcome {
    pub event_id: i64,
    pub deduplicated: bool,
}

/// Digest of the canonical event record. Field order is fixed and the
/// top-level keys of `event_data` are sorted, so two submissions that
/// differ only in JSON key order produce the same hash.
pub fn canonical_event_hash(
    experiment_id: Option<&str>,
    event_type: &str,
    session_id: Option<&str>,
    event_data: Option<&Value>,
) -> String {
    let mut record = Map::new();
    record.insert(
        "experiment_id".to_string(),
        experiment_id.map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    record.insert(
        "event_type".to_string(),
        Value::String(event_type.to_string()),
    );
    record.insert(
        "session_id".to_string(),
        session_id.map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    record.insert(
        "event_data".to_string(),
        event_data.map_or(Value::Null, sort_top_level_keys),
    );
    let canonical = Value::Object(record).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn sort_top_level_keys(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(value) = map.get(key) {
                    sorted.insert(key.clone(), value.clone());
                }
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

/// Record an event, collapsing replays of the same canonical record
/// inside the dedup window onto the original row. The check and the
/// insert are not atomic; a rare racing duplicate is tolerated since
/// the log feeds analytics, not billing.
pub fn submit_event(
    store: &Store,
    dedup_window_seconds: i64,
    submission: EventSubmission,
    user_agent: Option<String>,
    ip_country: Option<String>,
) -> Result<EventOutcome, StoreError> {
    let event_hash = canonical_event_hash(
        submission.experiment_id.as_deref(),
        &submission.event_type,
        submission.session_id.as_deref(),
        submission.event_data.as_ref(),
    );

    let window_start = crate::store::now_ms() - dedup_window_seconds * 1000;
    if let Some(event_id) = store.find_recent_event_by_hash(&event_hash, window_start)? {
        return Ok(EventOutcome {
            event_id,
            deduplicated: true,
        });
    }

    let event_data = submission
        .event_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let event_id = store.insert_event(NewEvent {
        experiment_id: submission.experiment_id,
        event_type: submission.event_type,
        event_data,
        event_hash,
        session_id: submission.session_id,
        visitor_id: submission.visitor_id,
        utm_source: submission.utm_source,
        utm_medium: submission.utm_medium,
        utm_campaign: submission.utm_campaign,
        referrer: submission.referrer,
        user_agent,
        ip_country,
    })?;
    Ok(EventOutcome {
        event_id,
        deduplicated: false,
    })
}
