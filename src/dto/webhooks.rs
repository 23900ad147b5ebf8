use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Inbound gateway event envelope. Only the fields this service consumes are
/// modeled; the rest of the payload is ignored on purpose.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<PaymentWrapper>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentWrapper {
    pub entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    /// The gateway's own order id, not ours.
    pub order_id: Option<String>,
    #[serde(default)]
    pub notes: PaymentNotes,
}

/// Metadata we attached when creating the remote order, round-tripped back
/// to us by the gateway.
#[derive(Debug, Default, Deserialize)]
pub struct PaymentNotes {
    pub order_id: Option<Uuid>,
}

/// 200-response body for the gateway; idempotent no-ops are reported, not
/// errored, so retries stop.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub result: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_event_parses_with_notes() {
        let body = r#"{
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_123",
                        "order_id": "order_gw_9",
                        "notes": { "order_id": "7f8a2f64-58cc-4a7b-9d2a-0a6c1f6f2b11" }
                    }
                }
            }
        }"#;
        let event: WebhookEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event, "payment.captured");
        let payment = event.payload.payment.unwrap().entity;
        assert_eq!(payment.id, "pay_123");
        assert!(payment.notes.order_id.is_some());
    }

    #[test]
    fn missing_notes_parse_as_empty() {
        let body = r#"{
            "event": "payment.failed",
            "payload": { "payment": { "entity": { "id": "pay_1" } } }
        }"#;
        let event: WebhookEvent = serde_json::from_str(body).unwrap();
        let payment = event.payload.payment.unwrap().entity;
        assert!(payment.notes.order_id.is_none());
    }
}
