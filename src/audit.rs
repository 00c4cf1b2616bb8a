use axum::{
    body::{to_bytes, Body, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::SUBJECT_LOG_WRITE;

/// Headers whose values are redacted before any audit record is built.
const SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Most bytes of a request/response body the middleware will buffer for
/// logging; matches the request body limit layer.
const MAX_LOGGED_BODY_BYTES: usize = 5 * 1024 * 1024;

pub const LOG_NAME_REQUEST: &str = "API_REQUEST_INGEST";
pub const LOG_NAME_RESPONSE: &str = "API_REQUEST_RESPOND";

/// Correlation key for one inbound request, threaded through handlers via
/// request extensions.
#[derive(Debug, Clone)]
pub struct ThreadKey(pub String);

/// One audit record: correlation key, event name, timestamp, and free-form
/// context. No persistence relationship to leads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub thread_key: String,
    pub name: String,
    /// ISO-8601 with millisecond precision, fixed at construction.
    pub timestamp: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl LogMessage {
    pub fn new(thread_key: String, name: &str, data: Map<String, Value>) -> Self {
        Self {
            thread_key,
            name: name.to_string(),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            data,
        }
    }
}

/// Generates a `<unixTimestamp>-<random6>-<hash10>` correlation key.
pub fn generate_thread_key() -> String {
    let timestamp = Utc::now().timestamp();
    let seed = Uuid::new_v4();
    let random = 100_000 + (seed.as_u128() % 900_000);

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let hash = hex::encode(hasher.finalize());

    format!("{}-{}-{}", timestamp, random, &hash[..10])
}

/// Fire-and-forget audit channel.
///
/// Producers enqueue onto an unbounded in-process channel and return
/// immediately; a background task publishes each record to the broker's log
/// subject. A failed send or publish is logged locally and dropped; it must
/// never fail the originating operation.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl AuditLogger {
    /// Spawns the publishing task and returns the logger plus its handle.
    pub fn spawn(jetstream: async_nats::jetstream::Context) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let payload = match serde_json::to_vec(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Failed to serialize audit record: {}", e);
                        continue;
                    }
                };

                match jetstream.publish(SUBJECT_LOG_WRITE, payload.into()).await {
                    Ok(ack) => {
                        if let Err(e) = ack.await {
                            tracing::warn!(
                                thread_key = %message.thread_key,
                                "Audit publish not acknowledged: {}",
                                e
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            thread_key = %message.thread_key,
                            "Failed to publish audit record: {}",
                            e
                        );
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// A logger whose records go nowhere. For tests and tooling.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    fn enqueue(&self, message: LogMessage) {
        // Best effort: a closed channel means the process is shutting down.
        let _ = self.tx.send(message);
    }

    pub fn info(&self, thread_key: &str, name: &str, context: Value) {
        self.enqueue(LogMessage::new(
            thread_key.to_string(),
            name,
            into_map(context),
        ));
    }

    pub fn log_error(
        &self,
        thread_key: &str,
        name: &str,
        error: &dyn std::fmt::Display,
        context: Value,
    ) {
        let mut data = Map::new();
        data.insert("error_message".to_string(), json!(error.to_string()));
        if !context.is_null() {
            data.insert("context".to_string(), context);
        }

        self.enqueue(LogMessage::new(thread_key.to_string(), name, data));
    }

    pub fn log_request(
        &self,
        thread_key: &str,
        method: &str,
        endpoint: &str,
        headers: &HeaderMap,
        query: Option<&str>,
        payload: Option<Value>,
    ) {
        let user_agent = header_string(headers, "user-agent");
        let content_type = header_string(headers, "content-type");

        let mut data = Map::new();
        data.insert("method".to_string(), json!(method));
        data.insert("endpoint".to_string(), json!(endpoint));
        data.insert("headers".to_string(), Value::Object(filter_headers(headers)));
        data.insert("query".to_string(), json!(query));
        data.insert("payload".to_string(), payload.unwrap_or(Value::Null));
        data.insert("user_agent".to_string(), json!(user_agent));
        data.insert("content_type".to_string(), json!(content_type));

        self.enqueue(LogMessage::new(
            thread_key.to_string(),
            LOG_NAME_REQUEST,
            data,
        ));
    }

    pub fn log_response(
        &self,
        thread_key: &str,
        status: u16,
        headers: &HeaderMap,
        payload: Option<Value>,
        duration_ms: f64,
    ) {
        let mut data = Map::new();
        data.insert("status".to_string(), json!(status));
        data.insert("payload".to_string(), payload.unwrap_or(Value::Null));
        data.insert("headers".to_string(), Value::Object(filter_headers(headers)));
        data.insert(
            "duration_ms".to_string(),
            json!((duration_ms * 100.0).round() / 100.0),
        );

        self.enqueue(LogMessage::new(
            thread_key.to_string(),
            LOG_NAME_RESPONSE,
            data,
        ));
    }
}

/// Header map with sensitive values replaced by `[FILTERED]`.
pub fn filter_headers(headers: &HeaderMap) -> Map<String, Value> {
    let mut filtered = Map::new();

    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if SENSITIVE_HEADERS.contains(&lower.as_str()) {
            filtered.insert(lower, json!("[FILTERED]"));
        } else {
            let text = value.to_str().unwrap_or("<binary>");
            filtered.insert(lower, json!(text));
        }
    }

    filtered
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("Unknown")
        .to_string()
}

fn into_map(context: Value) -> Map<String, Value> {
    match context {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("context".to_string(), other);
            map
        }
    }
}

/// Request/response audit middleware.
///
/// Generates the thread key, records the inbound request (with redacted
/// headers and buffered payload), times the handler, and records the outbound
/// response. Only `/api/` routes are audited; the health endpoint stays
/// silent.
pub async fn audit_middleware(
    State(audit): State<AuditLogger>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let thread_key = generate_thread_key();
    let method = request.method().to_string();
    let endpoint = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let request_headers = request.headers().clone();

    // Buffer the body so it can be both logged and handed to the handler.
    // The request limit layer sits outside this middleware, so an overflow
    // here means the client exceeded the limit mid-stream.
    let (mut parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, MAX_LOGGED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "success": false,
                    "error": "Request body too large",
                    "thread_key": thread_key,
                })),
            )
                .into_response();
        }
    };
    let payload = serde_json::from_slice::<Value>(&body_bytes).ok();

    parts.extensions.insert(ThreadKey(thread_key.clone()));
    let request = Request::from_parts(parts, Body::from(body_bytes));

    audit.log_request(
        &thread_key,
        &method,
        &endpoint,
        &request_headers,
        query.as_deref(),
        payload,
    );

    let start = Instant::now();
    let response = next.run(request).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    let status = response.status().as_u16();
    let response_headers = response.headers().clone();

    // Only buffer response bodies whose size is known and within the logging
    // cap; anything else passes through untouched with its payload unlogged.
    match response.body().size_hint().exact() {
        Some(len) if len as usize <= MAX_LOGGED_BODY_BYTES => {
            let (parts, body) = response.into_parts();
            let body_bytes = to_bytes(body, MAX_LOGGED_BODY_BYTES)
                .await
                .unwrap_or_default();
            let payload = serde_json::from_slice::<Value>(&body_bytes).ok();

            audit.log_response(&thread_key, status, &response_headers, payload, duration_ms);

            Response::from_parts(parts, Body::from(body_bytes))
        }
        _ => {
            audit.log_response(&thread_key, status, &response_headers, None, duration_ms);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn thread_key_has_three_segments() {
        let key = generate_thread_key();
        let parts: Vec<&str> = key.split('-').collect();

        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<i64>().is_ok());
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 10);
    }

    #[test]
    fn thread_keys_are_unique() {
        assert_ne!(generate_thread_key(), generate_thread_key());
    }

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("cookie", HeaderValue::from_static("session=abc"));
        headers.insert("x-api-key", HeaderValue::from_static("key123"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let filtered = filter_headers(&headers);

        assert_eq!(filtered["authorization"], json!("[FILTERED]"));
        assert_eq!(filtered["cookie"], json!("[FILTERED]"));
        assert_eq!(filtered["x-api-key"], json!("[FILTERED]"));
        assert_eq!(filtered["content-type"], json!("application/json"));
    }

    #[test]
    fn log_message_wire_shape_flattens_context() {
        let mut data = Map::new();
        data.insert("batch_id".to_string(), json!("1700000000_0"));
        let message = LogMessage::new("key-1".to_string(), "LEAD_QUEUED_FOR_PROCESSING", data);

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["thread_key"], json!("key-1"));
        assert_eq!(wire["name"], json!("LEAD_QUEUED_FOR_PROCESSING"));
        assert_eq!(wire["batch_id"], json!("1700000000_0"));
        // Millisecond precision, e.g. 2024-01-15T10:30:00.123Z
        assert!(wire["timestamp"].as_str().unwrap().contains('.'));
    }

    #[test]
    fn disconnected_logger_never_errors() {
        let audit = AuditLogger::disconnected();
        audit.info("key", "EVENT", json!({"a": 1}));
        audit.log_error("key", "EVENT_FAILED", &"boom", Value::Null);
    }
}
