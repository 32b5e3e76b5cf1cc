use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

/// A structured audit record emitted at business-significant moments
/// (payment reconciliation, disputes, bot filtering). Separate from
/// request tracing: audit events are the ones an operator greps for.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub name: &'static str,
    pub request_id: String,
    pub attributes: Map<String, Value>,
    pub alert: bool,
}

impl AuditEvent {
    pub fn new(name: &'static str, request_id: impl Into<String>) -> Self {
        Self {
            name,
            request_id: request_id.into(),
            attributes: Map::new(),
            alert: false,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Mark this event as requiring operator attention. Alert events
    /// log at error level regardless of filter configuration.
    #[must_use]
    pub fn alerting(mut self) -> Self {
        self.alert = true;
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Production sink: forwards audit events to the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let attributes = Value::Object(event.attributes.clone()).to_string();
        if event.alert {
            tracing::error!(
                audit = event.name,
                request_id = %event.request_id,
                %attributes,
                "audit event requires operator attention"
            );
        } else {
            tracing::info!(
                audit = event.name,
                request_id = %event.request_id,
                %attributes,
                "audit event"
            );
        }
    }
}

/// Test sink that captures events for assertion.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|event| event.name).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Clone)]
pub struct Observability {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observability").finish_non_exhaustive()
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            sink: Arc::new(TracingAuditSink),
        }
    }
}

impl Observability {
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn audit(&self, event: AuditEvent) {
        self.sink.record(&event);
    }

    pub fn increment_counter(&self, name: &'static str, request_id: &str) {
        tracing::debug!(counter = name, request_id = %request_id, "counter increment");
    }
}
