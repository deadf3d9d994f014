//! Webhook ingestion
//!
//! Parses an inbound webhook body, classifies it, and persists it as a
//! `pending` event. The store's unique constraint on the external event id is
//! the dedup mechanism; a duplicate delivery is acknowledged without
//! re-enqueueing, no matter how the deliveries interleave.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::models::WebhookEventType;
use crate::store::{NewWebhookEvent, WebhookEventStore};

/// Result of receiving one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sight: persisted in `pending` status, awaiting the queue.
    Accepted { event_id: String },
    /// The event id was already on file; nothing was written.
    Duplicate { event_id: String },
}

impl IngestOutcome {
    pub fn event_id(&self) -> &str {
        match self {
            Self::Accepted { event_id } | Self::Duplicate { event_id } => event_id,
        }
    }
}

pub struct WebhookIngestion {
    events: Arc<dyn WebhookEventStore>,
    max_retries: u32,
}

impl WebhookIngestion {
    pub fn new(events: Arc<dyn WebhookEventStore>, max_retries: u32) -> Self {
        Self { events, max_retries }
    }

    /// Ingest a raw webhook body from `source` (the provider path segment).
    ///
    /// The body must be a JSON document with an `eventType` discriminator.
    /// Signature verification happens before this is called.
    pub async fn ingest(&self, source: &str, body: &[u8]) -> BillingResult<IngestOutcome> {
        let document: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(format!("body is not valid JSON: {e}")))?;

        let provider_event_type = document
            .get("eventType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BillingError::InvalidPayload("missing eventType discriminator".to_string())
            })?
            .to_string();

        let event_type = WebhookEventType::from_provider(&provider_event_type);
        if event_type == WebhookEventType::Unclassified {
            tracing::warn!(
                provider_event_type = %provider_event_type,
                "Unmapped provider event type, storing as unclassified"
            );
        }

        // External event id is the idempotency key; fall back to a fresh id
        // when the provider omits one (such an event can never dedup, which
        // is the best we can do without a vendor id).
        let event_id = document
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("generated_{}", uuid::Uuid::new_v4()));

        let inner = document.get("payload");
        let related_transaction_id =
            extract_related_id(inner, &provider_event_type, "transId", "payment");
        let related_subscription_id =
            extract_related_id(inner, &provider_event_type, "subscriptionId", "subscription");

        let inserted = self
            .events
            .insert_if_absent(NewWebhookEvent {
                event_id: event_id.clone(),
                event_type,
                provider_event_type: provider_event_type.clone(),
                payload: document,
                source: source.to_string(),
                related_transaction_id,
                related_subscription_id,
                max_retries: self.max_retries,
            })
            .await?;

        if inserted {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                source = %source,
                "Webhook event accepted"
            );
            Ok(IngestOutcome::Accepted { event_id })
        } else {
            tracing::info!(
                event_id = %event_id,
                source = %source,
                "Duplicate webhook delivery, already on file"
            );
            Ok(IngestOutcome::Duplicate { event_id })
        }
    }
}

/// Best-effort related-entity extraction: a dedicated key in the inner
/// payload, else the inner payload's `id` when the vendor event-type string
/// mentions the entity kind.
fn extract_related_id(
    inner: Option<&serde_json::Value>,
    provider_event_type: &str,
    key: &str,
    kind_marker: &str,
) -> Option<String> {
    let inner = inner?;
    if let Some(value) = inner.get(key) {
        return value_as_id(value);
    }
    if provider_event_type.contains(kind_marker) {
        return inner.get("id").and_then(value_as_id);
    }
    None
}

fn value_as_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::WebhookEventStatus;
    use crate::store::{EventFilter, InMemoryWebhookEventStore};

    fn ingestion() -> (WebhookIngestion, Arc<InMemoryWebhookEventStore>) {
        let store = Arc::new(InMemoryWebhookEventStore::new());
        (WebhookIngestion::new(store.clone(), 3), store)
    }

    #[tokio::test]
    async fn first_delivery_is_accepted_and_pending() {
        let (ingestion, store) = ingestion();
        let body = br#"{"eventType":"payment.completed","id":"evt_1","payload":{"transId":"T1"}}"#;

        let outcome = ingestion.ingest("authnet", body).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                event_id: "evt_1".into()
            }
        );

        let event = store.find_by_event_id("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookEventStatus::Pending);
        assert_eq!(event.event_type, WebhookEventType::PaymentCompleted);
        assert_eq!(event.related_transaction_id.as_deref(), Some("T1"));
        assert_eq!(event.source, "authnet");
        assert_eq!(event.max_retries, 3);
    }

    #[tokio::test]
    async fn second_delivery_is_a_duplicate_with_one_persisted_event() {
        let (ingestion, store) = ingestion();
        let body = br#"{"eventType":"payment.completed","id":"evt_dup","payload":{}}"#;

        ingestion.ingest("authnet", body).await.unwrap();
        let second = ingestion.ingest("authnet", body).await.unwrap();
        assert_eq!(
            second,
            IngestOutcome::Duplicate {
                event_id: "evt_dup".into()
            }
        );

        let (_, total) = store.list(&EventFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let (ingestion, _) = ingestion();
        let err = ingestion.ingest("authnet", b"{not json").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn missing_event_type_is_rejected() {
        let (ingestion, _) = ingestion();
        let err = ingestion
            .ingest("authnet", br#"{"id":"evt_2","payload":{}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn missing_event_id_gets_a_generated_one() {
        let (ingestion, _) = ingestion();
        let outcome = ingestion
            .ingest("authnet", br#"{"eventType":"payment.failed","payload":{}}"#)
            .await
            .unwrap();
        assert!(outcome.event_id().starts_with("generated_"));
    }

    #[tokio::test]
    async fn payment_event_falls_back_to_inner_id_for_transaction() {
        let (ingestion, store) = ingestion();
        let body =
            br#"{"eventType":"net.authorize.payment.authcapture.created","id":"evt_3","payload":{"id":"12345"}}"#;
        ingestion.ingest("authnet", body).await.unwrap();

        let event = store.find_by_event_id("evt_3").await.unwrap().unwrap();
        assert_eq!(event.related_transaction_id.as_deref(), Some("12345"));
        assert_eq!(event.related_subscription_id, None);
    }

    #[tokio::test]
    async fn subscription_event_extracts_subscription_id() {
        let (ingestion, store) = ingestion();
        let body =
            br#"{"eventType":"subscription.cancelled","id":"evt_4","payload":{"id":"sub_9"}}"#;
        ingestion.ingest("authnet", body).await.unwrap();

        let event = store.find_by_event_id("evt_4").await.unwrap().unwrap();
        assert_eq!(event.related_subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(event.related_transaction_id, None);
    }

    #[tokio::test]
    async fn numeric_trans_id_is_stringified() {
        let (ingestion, store) = ingestion();
        let body =
            br#"{"eventType":"payment.completed","id":"evt_5","payload":{"transId":60123}}"#;
        ingestion.ingest("authnet", body).await.unwrap();

        let event = store.find_by_event_id("evt_5").await.unwrap().unwrap();
        assert_eq!(event.related_transaction_id.as_deref(), Some("60123"));
    }

    #[tokio::test]
    async fn unmapped_type_is_stored_as_unclassified() {
        let (ingestion, store) = ingestion();
        let body = br#"{"eventType":"vendor.surprise.event","id":"evt_6","payload":{}}"#;
        ingestion.ingest("authnet", body).await.unwrap();

        let event = store.find_by_event_id("evt_6").await.unwrap().unwrap();
        assert_eq!(event.event_type, WebhookEventType::Unclassified);
        assert_eq!(event.provider_event_type, "vendor.surprise.event");
    }
}
