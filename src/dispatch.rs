use crate::audit::AuditLogger;
use crate::broker::SUBJECT_LEAD_PROCESS;
use crate::errors::AppError;
use crate::models::{DispatchSummary, ProcessLeadMessage};
use async_nats::jetstream;
use chrono::Utc;
use serde_json::{json, Map, Value};

/// Default and maximum number of leads per bulk chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const MAX_CHUNK_SIZE: usize = 100;

/// Publishes lead submissions onto the work queue.
///
/// Every publish waits for the broker's acknowledgment before reporting
/// success, so an accepted async submission is durably enqueued.
pub struct LeadDispatcher {
    jetstream: jetstream::Context,
    audit: AuditLogger,
}

impl LeadDispatcher {
    pub fn new(jetstream: jetstream::Context, audit: AuditLogger) -> Self {
        Self { jetstream, audit }
    }

    /// Publishes a single lead payload for asynchronous processing.
    pub async fn dispatch(
        &self,
        thread_key: &str,
        payload: Map<String, Value>,
        batch_id: Option<String>,
    ) -> Result<(), AppError> {
        let email = payload
            .get("email")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let message = ProcessLeadMessage {
            lead_payload: payload,
            batch_id: batch_id.clone(),
        };
        let bytes = serde_json::to_vec(&message)
            .map_err(|e| AppError::Internal(format!("Failed to serialize queue message: {}", e)))?;

        let publish = async {
            let ack = self
                .jetstream
                .publish(SUBJECT_LEAD_PROCESS, bytes.into())
                .await?;
            ack.await
                .map_err(|e| AppError::Broker(format!("Publish not acknowledged: {}", e)))?;
            Ok::<(), AppError>(())
        };

        match publish.await {
            Ok(()) => {
                self.audit.info(
                    thread_key,
                    "LEAD_QUEUED_FOR_PROCESSING",
                    json!({ "email": email, "batch_id": batch_id }),
                );
                Ok(())
            }
            Err(e) => {
                self.audit.log_error(
                    thread_key,
                    "FAILED_TO_QUEUE_LEAD_FOR_PROCESSING",
                    &e,
                    json!({ "email": email, "batch_id": batch_id }),
                );
                Err(e)
            }
        }
    }

    /// Fans a bulk submission out as individual queue messages.
    ///
    /// Leads are split into chunks of at most `chunk_size` (bounded to
    /// 1..=100); each chunk shares a batch id of the form
    /// `<unixTimestamp>_<chunkIndex>`, and each lead within it is published
    /// as its own message. Fails on the first publish that the broker does
    /// not acknowledge.
    pub async fn dispatch_chunked(
        &self,
        thread_key: &str,
        leads: Vec<Value>,
        chunk_size: Option<usize>,
    ) -> Result<DispatchSummary, AppError> {
        let chunk_size = clamp_chunk_size(chunk_size);
        let total_leads = leads.len();
        let stamp = Utc::now().timestamp();

        let mut batch_ids = Vec::new();
        for (index, chunk) in leads.chunks(chunk_size).enumerate() {
            let batch_id = format!("{}_{}", stamp, index);

            for lead in chunk {
                let payload = flatten_lead_payload(lead);
                self.dispatch(thread_key, payload, Some(batch_id.clone()))
                    .await?;
            }

            batch_ids.push(batch_id);
        }

        let summary = DispatchSummary {
            total_leads,
            total_chunks: batch_ids.len(),
            batch_ids,
        };

        self.audit.info(
            thread_key,
            "LEADS_QUEUED_IN_CHUNKS",
            json!({
                "total_leads": summary.total_leads,
                "total_chunks": summary.total_chunks,
                "chunk_size": chunk_size,
                "batch_ids": summary.batch_ids,
            }),
        );

        Ok(summary)
    }
}

pub fn clamp_chunk_size(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .clamp(1, MAX_CHUNK_SIZE)
}

/// Flattens a bulk lead entry (`{email, fields: {...}}`) into the flat
/// payload shape the processor consumes. Entries under `fields` are merged
/// beside `email`; a non-object entry degrades to an empty payload.
pub fn flatten_lead_payload(lead: &Value) -> Map<String, Value> {
    let Some(entry) = lead.as_object() else {
        return Map::new();
    };

    let mut payload = Map::new();
    for (key, value) in entry {
        if key != "fields" {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(fields) = entry.get("fields").and_then(|v| v.as_object()) {
        for (key, value) in fields {
            payload.insert(key.clone(), value.clone());
        }
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_size_is_bounded() {
        assert_eq!(clamp_chunk_size(None), 50);
        assert_eq!(clamp_chunk_size(Some(0)), 1);
        assert_eq!(clamp_chunk_size(Some(25)), 25);
        assert_eq!(clamp_chunk_size(Some(500)), 100);
    }

    #[test]
    fn flatten_merges_fields_beside_email() {
        let payload = flatten_lead_payload(&json!({
            "email": "ada@example.com",
            "fields": {
                "firstName": "Ada",
                "company": "Analytical Engines"
            }
        }));

        assert_eq!(payload["email"], json!("ada@example.com"));
        assert_eq!(payload["firstName"], json!("Ada"));
        assert_eq!(payload["company"], json!("Analytical Engines"));
        assert!(payload.get("fields").is_none());
    }

    #[test]
    fn flatten_tolerates_missing_fields_and_non_objects() {
        let payload = flatten_lead_payload(&json!({ "email": "a@b.com" }));
        assert_eq!(payload.len(), 1);

        assert!(flatten_lead_payload(&json!("not an object")).is_empty());
    }

    #[test]
    fn chunk_count_is_ceiling_of_leads_over_size() {
        let leads: Vec<Value> = (0..101).map(|i| json!({ "email": format!("u{}@x.com", i) })).collect();
        let chunks: Vec<_> = leads.chunks(50).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 1);
    }
}
