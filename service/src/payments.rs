use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::leads::normalize_email;
use crate::observability::{AuditEvent, Observability};
use crate::store::{Conflict, NewEvent, NewPayment, Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("webhook signing is misconfigured")]
    SigningKey,
    #[error("missing stripe-signature header")]
    MissingSignatureHeader,
    #[error("malformed stripe-signature header")]
    MalformedHeader,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed webhook payload")]
    MalformedPayload,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

pub(crate) fn compute_signature(
    secret: &str,
    timestamp: &str,
    raw_body: &[u8],
) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::SigningKey)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>`) against the
/// raw request body.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    raw_body: &[u8],
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => (timestamp, signature),
        _ => return Err(WebhookError::MalformedHeader),
    };
    if compute_signature(secret, timestamp, raw_body)? == signature {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Verify and apply one Stripe webhook delivery. Safe to re-run from
/// scratch: the succeeded path is idempotent by payment intent id and
/// the status-flip paths re-apply the same value on replay.
pub fn handle_webhook(
    store: &Store,
    observability: &Observability,
    secret: Option<&str>,
    signature_header: Option<&str>,
    raw_body: &[u8],
    request_id: &str,
) -> Result<(), WebhookError> {
    let secret = secret.ok_or(WebhookError::MissingSecret)?;
    let signature_header = signature_header.ok_or(WebhookError::MissingSignatureHeader)?;
    verify_signature(secret, signature_header, raw_body)?;

    let event: StripeEvent =
        serde_json::from_slice(raw_body).map_err(|_| WebhookError::MalformedPayload)?;
    let object = &event.data.object;

    match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            handle_payment_succeeded(store, observability, object, request_id)
        }
        "payment_intent.payment_failed" => {
            handle_payment_failed(store, observability, object, request_id)
        }
        "charge.refunded" => handle_charge_refunded(store, observability, object, request_id),
        "charge.dispute.created" => {
            handle_dispute_created(store, observability, object, request_id)
        }
        other => {
            // Unknown event types are acknowledged, not errored, so a
            // widened Stripe subscription never breaks deliveries.
            tracing::debug!(event_type = other, request_id, "ignoring webhook event type");
            Ok(())
        }
    }
}

fn handle_payment_succeeded(
    store: &Store,
    observability: &Observability,
    object: &Value,
    request_id: &str,
) -> Result<(), WebhookError> {
    let intent_id = string_field(object, "id").ok_or(WebhookError::MalformedPayload)?;

    if store.get_payment_by_intent(&intent_id)?.is_some() {
        observability.increment_counter("payment_webhook_replays", request_id);
        return Ok(());
    }

    let metadata = object.get("metadata").and_then(Value::as_object);
    let metadata_lead_id = metadata
        .and_then(|map| map.get("lead_id"))
        .and_then(metadata_i64);
    let metadata_experiment_id = metadata
        .and_then(|map| map.get("experiment_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let lead = match metadata_lead_id {
        Some(lead_id) => store.get_lead(lead_id)?,
        None => match string_field(object, "receipt_email") {
            Some(email) => store.find_latest_lead_by_email(&normalize_email(&email))?,
            None => None,
        },
    };

    let amount_cents = object
        .get("amount_received")
        .or_else(|| object.get("amount"))
        .and_then(Value::as_i64)
        .ok_or(WebhookError::MalformedPayload)?;
    let currency = string_field(object, "currency").unwrap_or_else(|| "usd".to_string());
    let experiment_id =
        metadata_experiment_id.or_else(|| lead.as_ref().map(|lead| lead.experiment_id.clone()));

    let inserted = store.insert_payment(NewPayment {
        experiment_id: experiment_id.clone(),
        lead_id: lead.as_ref().map(|lead| lead.id),
        stripe_payment_intent_id: intent_id.clone(),
        stripe_customer_id: string_field(object, "customer"),
        stripe_charge_id: string_field(object, "latest_charge"),
        amount_cents,
        currency,
        payment_method_type: object
            .get("payment_method_types")
            .and_then(Value::as_array)
            .and_then(|types| types.first())
            .and_then(Value::as_str)
            .map(str::to_string),
        receipt_url: string_field(object, "receipt_url"),
    });
    match inserted {
        Ok(_) => {}
        // Two concurrent deliveries of the same intent: the constraint
        // rejected this one, so the payment is already recorded.
        Err(StoreError::Conflict(Conflict::PaymentIntent)) => return Ok(()),
        Err(error) => return Err(error.into()),
    }

    if let Some(lead) = &lead {
        store.record_lead_payment(lead.id, &intent_id, amount_cents, "succeeded")?;
    }

    observability.audit(
        AuditEvent::new("payment_recorded", request_id)
            .with_attribute("payment_intent", intent_id)
            .with_attribute("amount_cents", amount_cents)
            .with_attribute(
                "lead_id",
                lead.map_or(Value::Null, |lead| Value::from(lead.id)),
            ),
    );
    Ok(())
}

fn handle_payment_failed(
    store: &Store,
    observability: &Observability,
    object: &Value,
    request_id: &str,
) -> Result<(), WebhookError> {
    let intent_id = string_field(object, "id").ok_or(WebhookError::MalformedPayload)?;
    // Failures are logged for analysis but never become payment rows.
    store.insert_event(NewEvent {
        experiment_id: object
            .get("metadata")
            .and_then(|map| map.get("experiment_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        event_type: "payment_failed".to_string(),
        event_data: Some(
            serde_json::json!({"stripe_payment_intent_id": intent_id}).to_string(),
        ),
        event_hash: crate::events::canonical_event_hash(
            None,
            "payment_failed",
            Some(&intent_id),
            None,
        ),
        ..Default::default()
    })?;
    observability.audit(
        AuditEvent::new("payment_failed", request_id)
            .with_attribute("payment_intent", intent_id),
    );
    Ok(())
}

fn handle_charge_refunded(
    store: &Store,
    observability: &Observability,
    object: &Value,
    request_id: &str,
) -> Result<(), WebhookError> {
    let intent_id =
        string_field(object, "payment_intent").ok_or(WebhookError::MalformedPayload)?;
    let updated = store.update_payment_status_by_intent(&intent_id, "refunded")?;
    let leads_updated = store.propagate_payment_status_to_leads(&intent_id, "refunded")?;
    observability.audit(
        AuditEvent::new("payment_refunded", request_id)
            .with_attribute("payment_intent", intent_id)
            .with_attribute("payment_row_updated", updated)
            .with_attribute("leads_updated", leads_updated as i64),
    );
    Ok(())
}

fn handle_dispute_created(
    store: &Store,
    observability: &Observability,
    object: &Value,
    request_id: &str,
) -> Result<(), WebhookError> {
    let intent_id =
        string_field(object, "payment_intent").ok_or(WebhookError::MalformedPayload)?;
    store.update_payment_status_by_intent(&intent_id, "disputed")?;
    store.insert_event(NewEvent {
        event_type: "payment_disputed".to_string(),
        event_data: Some(
            serde_json::json!({"stripe_payment_intent_id": intent_id}).to_string(),
        ),
        event_hash: crate::events::canonical_event_hash(
            None,
            "payment_disputed",
            Some(&intent_id),
            None,
        ),
        ..Default::default()
    })?;
    observability.audit(
        AuditEvent::new("payment_disputed", request_id)
            .with_attribute("payment_intent", intent_id)
            .alerting(),
    );
    Ok(())
}

fn string_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn metadata_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        // Stripe metadata values arrive as strings.
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::{Archetype, ExperimentStatus};
    use crate::leads::{submit_lead, LeadContext, LeadSubmission};
    use crate::observability::RecordingAuditSink;
    use crate::store::{ExperimentUpdate, NewExperiment};
    use std::sync::Arc;

    const SECRET: &str = "whsec_test_secret";

    fn signed_header(body: &[u8]) -> String {
        let timestamp = "1724800000";
        let signature = compute_signature(SECRET, timestamp, body).expect("signature");
        format!("t={timestamp},v1={signature}")
    }

    fn recording() -> (Observability, Arc<RecordingAuditSink>) {
        let sink = Arc::new(RecordingAuditSink::default());
        (Observability::with_sink(sink.clone()), sink)
    }

    fn deliver(
        store: &Store,
        observability: &Observability,
        body: &Value,
    ) -> Result<(), WebhookError> {
        let raw = body.to_string();
        handle_webhook(
            store,
            observability,
            Some(SECRET),
            Some(&signed_header(raw.as_bytes())),
            raw.as_bytes(),
            "req_test",
        )
    }

    fn launched_experiment_with_lead(store: &Store) -> (String, i64) {
        let record = store
            .create_experiment(NewExperiment {
                name: "Presale".to_string(),
                slug: "presale".to_string(),
                archetype: Archetype::Presale,
                problem_statement: None,
                target_audience: None,
                value_proposition: None,
                market_size_estimate: None,
                min_signups: None,
                max_spend_cents: None,
                max_duration_days: None,
                kill_criteria: None,
                copy_pack: None,
                creative_brief: None,
                stripe_price_id: None,
                stripe_product_id: None,
                price_cents: Some(4900),
            })
            .expect("create");
        for status in [
            ExperimentStatus::Preflight,
            ExperimentStatus::Build,
            ExperimentStatus::Launch,
        ] {
            store
                .update_experiment(
                    &record.id,
                    ExperimentUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .expect("transition");
        }
        let outcome = submit_lead(
            store,
            LeadSubmission {
                experiment_id: Some(record.id.clone()),
                email: Some("buyer@example.com".to_string()),
                ..Default::default()
            },
            LeadContext::default(),
        )
        .expect("lead");
        (record.id, outcome.lead_id)
    }

    fn succeeded_event(intent: &str, lead_id: Option<i64>) -> Value {
        let mut metadata = serde_json::Map::new();
        if let Some(lead_id) = lead_id {
            metadata.insert("lead_id".to_string(), Value::String(lead_id.to_string()));
        }
        serde_json::json!({
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": intent,
                "amount_received": 4900,
                "currency": "usd",
                "receipt_email": "Buyer@Example.com",
                "metadata": metadata,
            }}
        })
    }

    #[test]
    fn rejects_bad_signature() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let body = succeeded_event("pi_1", None).to_string();
        let result = handle_webhook(
            &store,
            &observability,
            Some(SECRET),
            Some("t=1724800000,v1=deadbeef"),
            body.as_bytes(),
            "req_test",
        );
        assert!(matches!(result, Err(WebhookError::InvalidSignature)));
    }

    #[test]
    fn rejects_malformed_header() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let result = handle_webhook(
            &store,
            &observability,
            Some(SECRET),
            Some("v1=cafe"),
            b"{}",
            "req_test",
        );
        assert!(matches!(result, Err(WebhookError::MalformedHeader)));
    }

    #[test]
    fn missing_secret_is_a_configuration_error() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let result = handle_webhook(&store, &observability, None, Some("t=1,v1=2"), b"{}", "req");
        assert!(matches!(result, Err(WebhookError::MissingSecret)));
    }

    #[test]
    fn succeeded_webhook_records_payment_and_updates_lead() {
        let store = Store::open(None).expect("store");
        let (observability, sink) = recording();
        let (_, lead_id) = launched_experiment_with_lead(&store);

        deliver(&store, &observability, &succeeded_event("pi_1", Some(lead_id)))
            .expect("webhook applies");

        let payment = store.get_payment_by_intent("pi_1").unwrap().unwrap();
        assert_eq!(payment.status, "succeeded");
        assert_eq!(payment.lead_id, Some(lead_id));
        let lead = store.get_lead(lead_id).unwrap().unwrap();
        assert_eq!(lead.payment_status.as_deref(), Some("succeeded"));
        assert_eq!(lead.stripe_payment_id.as_deref(), Some("pi_1"));
        assert_eq!(lead.payment_amount_cents, Some(4900));
        assert!(sink.names().contains(&"payment_recorded"));
    }

    #[test]
    fn replayed_succeeded_webhook_is_idempotent() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let (_, lead_id) = launched_experiment_with_lead(&store);
        let event = succeeded_event("pi_replay", Some(lead_id));

        for _ in 0..3 {
            deliver(&store, &observability, &event).expect("replay acknowledged");
        }
        assert!(store.get_payment_by_intent("pi_replay").unwrap().is_some());
        // A second insert would have tripped the intent-id constraint.
        let duplicate = store.insert_payment(crate::store::NewPayment {
            experiment_id: None,
            lead_id: None,
            stripe_payment_intent_id: "pi_replay".to_string(),
            stripe_customer_id: None,
            stripe_charge_id: None,
            amount_cents: 4900,
            currency: "usd".to_string(),
            payment_method_type: None,
            receipt_url: None,
        });
        assert!(duplicate.is_err());
    }

    #[test]
    fn lead_resolution_falls_back_to_receipt_email() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let (_, lead_id) = launched_experiment_with_lead(&store);

        deliver(&store, &observability, &succeeded_event("pi_email", None))
            .expect("webhook applies");

        let payment = store.get_payment_by_intent("pi_email").unwrap().unwrap();
        assert_eq!(payment.lead_id, Some(lead_id));
    }

    #[test]
    fn refund_propagates_to_payment_and_lead() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let (_, lead_id) = launched_experiment_with_lead(&store);
        deliver(&store, &observability, &succeeded_event("pi_ref", Some(lead_id)))
            .expect("succeeded");

        let refund = serde_json::json!({
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_1", "payment_intent": "pi_ref"}}
        });
        deliver(&store, &observability, &refund).expect("refund applies");

        let payment = store.get_payment_by_intent("pi_ref").unwrap().unwrap();
        assert_eq!(payment.status, "refunded");
        let lead = store.get_lead(lead_id).unwrap().unwrap();
        assert_eq!(lead.payment_status.as_deref(), Some("refunded"));
    }

    #[test]
    fn dispute_flips_status_and_alerts() {
        let store = Store::open(None).expect("store");
        let (observability, sink) = recording();
        let (_, lead_id) = launched_experiment_with_lead(&store);
        deliver(&store, &observability, &succeeded_event("pi_disp", Some(lead_id)))
            .expect("succeeded");

        let dispute = serde_json::json!({
            "type": "charge.dispute.created",
            "data": {"object": {"id": "dp_1", "payment_intent": "pi_disp"}}
        });
        deliver(&store, &observability, &dispute).expect("dispute applies");

        let payment = store.get_payment_by_intent("pi_disp").unwrap().unwrap();
        assert_eq!(payment.status, "disputed");
        let alert = sink
            .events()
            .into_iter()
            .find(|event| event.name == "payment_disputed")
            .expect("dispute audit event");
        assert!(alert.alert);
    }

    #[test]
    fn failed_payment_logs_without_a_payment_row() {
        let store = Store::open(None).expect("store");
        let (observability, sink) = recording();
        let failed = serde_json::json!({
            "type": "payment_intent.payment_failed",
            "data": {"object": {"id": "pi_fail"}}
        });
        deliver(&store, &observability, &failed).expect("failure acknowledged");
        assert!(store.get_payment_by_intent("pi_fail").unwrap().is_none());
        assert!(sink.names().contains(&"payment_failed"));
    }

    #[test]
    fn unknown_event_types_are_acknowledged() {
        let store = Store::open(None).expect("store");
        let (observability, _) = recording();
        let unknown = serde_json::json!({
            "type": "customer.created",
            "data": {"object": {"id": "cus_1"}}
        });
        deliver(&store, &observability, &unknown).expect("acknowledged");
    }
}
