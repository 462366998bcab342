//! Wire form of a queued message body.

use serde::{Deserialize, Serialize};

/// Current payload schema version.
pub const PAYLOAD_VERSION: &str = "1";

/// JSON body stored at `message:{messageId}`.
///
/// `queue` and `parent_queue` hold fully resolved keys so that ack, nack and
/// the requeue workers can operate on a message without re-resolving tenant
/// identity. `data` is opaque to the broker apart from the trace context
/// fields injected at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub version: String,
    pub data: serde_json::Value,
    /// Resolved child queue key the message belongs to.
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Enqueue timestamp in epoch milliseconds; doubles as the queue score.
    pub timestamp: i64,
    pub message_id: String,
    /// Parent "queue of queues" key recorded at enqueue time.
    pub parent_queue: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_form_is_camel_case() {
        let payload = MessagePayload {
            version: PAYLOAD_VERSION.to_string(),
            data: json!({"x": 1}),
            queue: "marqs:queue:o:e:q".to_string(),
            concurrency_key: None,
            timestamp: 1700000000000,
            message_id: "m_1".to_string(),
            parent_queue: "marqs:sharedQueue".to_string(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["messageId"], "m_1");
        assert_eq!(value["parentQueue"], "marqs:sharedQueue");
        // Absent concurrency key is omitted entirely, not null.
        assert!(value.get("concurrencyKey").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let payload = MessagePayload {
            version: PAYLOAD_VERSION.to_string(),
            data: json!({"nested": {"k": "v"}}),
            queue: "marqs:queue:o:e:q:ck:user-1".to_string(),
            concurrency_key: Some("user-1".to_string()),
            timestamp: 42,
            message_id: "m_2".to_string(),
            parent_queue: "marqs:env:e:sharedQueue".to_string(),
        };

        let raw = serde_json::to_string(&payload).unwrap();
        let back: MessagePayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, payload);
    }
}
