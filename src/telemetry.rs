//! Tracing setup, per-operation spans, and trace-context propagation.
//!
//! Every broker operation runs inside a span carrying messaging-semantic
//! attributes. An operation that finds no work marks its span with
//! `marqs.aborted = true` instead of an error status, so the tracing
//! pipeline can tell "idle" apart from "failed". W3C trace context is
//! injected into the message payload at enqueue and can be extracted by the
//! consumer from the dequeued payload.

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::{field, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `messaging.system` attribute value on every span.
pub const MESSAGING_SYSTEM: &str = "marqs";

/// One-time telemetry setup: installs the process-wide subscriber and
/// registers the W3C propagator that [`inject_trace_context`] and
/// [`extract_trace_context`] go through.
///
/// Output format follows the build profile — human-readable for local
/// work, flattened JSON from release binaries so aggregators can index the
/// span fields. Filtering honors `RUST_LOG` and falls back to `info`.
pub fn init_telemetry() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    if cfg!(debug_assertions) {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    }
}

pub(crate) fn publish_span(
    queue: &str,
    parent_queue: &str,
    message_id: &str,
    concurrency_key: Option<&str>,
) -> Span {
    tracing::info_span!(
        "marqs.publish",
        otel.kind = "PRODUCER",
        otel.status_code = field::Empty,
        error.message = field::Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "publish",
        messaging.message_id = %message_id,
        marqs.queue = %queue,
        marqs.parentQueue = %parent_queue,
        marqs.messageId = %message_id,
        marqs.concurrencyKey = concurrency_key.unwrap_or_default(),
    )
}

pub(crate) fn receive_span(parent_queue: &str) -> Span {
    tracing::info_span!(
        "marqs.receive",
        otel.kind = "CONSUMER",
        otel.status_code = field::Empty,
        error.message = field::Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "receive",
        messaging.message_id = field::Empty,
        marqs.parentQueue = %parent_queue,
        marqs.queue = field::Empty,
        marqs.messageId = field::Empty,
        marqs.queueCount = field::Empty,
        marqs.queueChoice = field::Empty,
        marqs.nextRange = field::Empty,
        marqs.queues = field::Empty,
        marqs.queuesWithScores = field::Empty,
        marqs.aborted = field::Empty,
    )
}

pub(crate) fn ack_span(message_id: &str) -> Span {
    tracing::info_span!(
        "marqs.ack",
        otel.kind = "CONSUMER",
        otel.status_code = field::Empty,
        error.message = field::Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "ack",
        messaging.message_id = %message_id,
        marqs.messageId = %message_id,
        marqs.queue = field::Empty,
    )
}

pub(crate) fn nack_span(message_id: &str) -> Span {
    tracing::info_span!(
        "marqs.nack",
        otel.kind = "CONSUMER",
        otel.status_code = field::Empty,
        error.message = field::Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "nack",
        messaging.message_id = %message_id,
        marqs.messageId = %message_id,
        marqs.queue = field::Empty,
    )
}

pub(crate) fn replace_span(message_id: &str) -> Span {
    tracing::info_span!(
        "marqs.replace",
        otel.kind = "CONSUMER",
        otel.status_code = field::Empty,
        error.message = field::Empty,
        messaging.system = MESSAGING_SYSTEM,
        messaging.operation = "replace",
        messaging.message_id = %message_id,
        marqs.messageId = %message_id,
        marqs.queue = field::Empty,
    )
}

/// Mark the current operation as "found no work".
pub(crate) fn mark_aborted(span: &Span) {
    span.record("marqs.aborted", true);
}

/// Record a store failure on the span before propagating it.
pub(crate) fn record_failure(span: &Span, err: &crate::error::MarqsError) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", field::display(err));
}

struct JsonInjector<'a>(&'a mut serde_json::Map<String, serde_json::Value>);

impl Injector for JsonInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0
            .insert(key.to_string(), serde_json::Value::String(value));
    }
}

struct JsonExtractor<'a>(&'a serde_json::Map<String, serde_json::Value>);

impl Extractor for JsonExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Inject the current span's trace context into a payload `data` object.
/// Non-object payloads are left untouched.
pub fn inject_trace_context(data: &mut serde_json::Value) {
    let serde_json::Value::Object(map) = data else {
        return;
    };
    let cx = Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut JsonInjector(map));
    });
}

/// Extract the trace context a producer injected into a payload `data`
/// object. Consumers parent their processing span on the returned context.
pub fn extract_trace_context(data: &serde_json::Value) -> opentelemetry::Context {
    match data {
        serde_json::Value::Object(map) => opentelemetry::global::get_text_map_propagator(
            |propagator| propagator.extract(&JsonExtractor(map)),
        ),
        _ => opentelemetry::Context::current(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injection_skips_non_object_payloads() {
        let mut data = json!("scalar");
        inject_trace_context(&mut data);
        assert_eq!(data, json!("scalar"));
    }

    #[test]
    fn extractor_reads_string_fields_only() {
        let data = json!({"traceparent": "00-abc-def-01", "count": 3});
        let map = data.as_object().unwrap();
        let extractor = JsonExtractor(map);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("count"), None);
        assert!(extractor.keys().contains(&"traceparent"));
    }

    #[test]
    fn injector_writes_string_fields() {
        let mut data = json!({});
        {
            let map = data.as_object_mut().unwrap();
            let mut injector = JsonInjector(map);
            injector.set("traceparent", "00-abc-def-01".to_string());
        }
        assert_eq!(data["traceparent"], "00-abc-def-01");
    }
}
