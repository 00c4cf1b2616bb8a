use crate::audit::{generate_thread_key, AuditLogger, ThreadKey};
use crate::dispatch::LeadDispatcher;
use crate::errors::AppError;
use crate::models::{LeadFilter, LeadFilterParams, LeadWithAttributes};
use crate::processor::LeadProcessor;
use crate::store::LeadStore;
use axum::{
    body::Bytes,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LeadStore>,
    pub processor: Arc<LeadProcessor>,
    pub dispatcher: Arc<LeadDispatcher>,
    pub audit: AuditLogger,
}

/// Fixed fields that must be present before a synchronous or asynchronous
/// submission is accepted at the HTTP boundary.
const REQUIRED_FIELDS: [&str; 3] = ["firstName", "lastName", "email"];

fn resolve_thread_key(ext: Option<Extension<ThreadKey>>) -> String {
    match ext {
        Some(Extension(ThreadKey(key))) => key,
        None => generate_thread_key(),
    }
}

fn missing_required_fields(payload: &Map<String, Value>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .filter(|field| {
            payload
                .get(**field)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .is_none()
        })
        .copied()
        .collect()
}

/// Parses a raw request body into a non-empty JSON object, answering the
/// standard error envelope on failure. The `Json` extractor is bypassed so a
/// malformed body still gets a `success`/`thread_key` response.
fn parse_object_body(bytes: &[u8], thread_key: &str) -> Result<Map<String, Value>, Response> {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "Invalid JSON payload",
                    "thread_key": thread_key,
                })),
            )
                .into_response());
        }
    };

    match value.as_object().filter(|map| !map.is_empty()) {
        Some(map) => Ok(map.clone()),
        None => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Request body must be a JSON object",
                "thread_key": thread_key,
            })),
        )
            .into_response()),
    }
}

fn created_response(thread_key: &str, lead: &LeadWithAttributes) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Lead processed successfully",
            "data": {
                "id": lead.lead.id,
                "firstName": lead.lead.first_name,
                "lastName": lead.lead.last_name,
                "email": lead.lead.email,
                "phone": lead.lead.phone,
                "status": lead.lead.status,
                "createdAt": lead.lead.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
            "thread_key": thread_key,
        })),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "lead-intake-api",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// POST /api/v1/lead/process
///
/// Synchronous ingestion: validate, deduplicate, persist, and answer with the
/// stored lead. A duplicate email answers 409 whether it is caught by the
/// pre-check or by the unique index during the insert race.
pub async fn process_lead(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
    body: Bytes,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    let payload = match parse_object_body(&body, &thread_key) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let missing = missing_required_fields(&payload);
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Missing required fields",
                "missing_fields": missing,
                "thread_key": thread_key,
            })),
        )
            .into_response();
    }

    // Pre-check is an optimization; the unique index is the backstop.
    let email = payload
        .get("email")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim();
    match state.store.find_by_email(email).await {
        Ok(Some(existing)) => {
            return conflict_response(&thread_key, Some(existing.id));
        }
        Ok(None) => {}
        Err(e) => return server_error(&state, &thread_key, e).await,
    }

    match state.processor.process(&payload).await {
        Ok(lead) => created_response(&thread_key, &lead),
        Err(AppError::Validation(violations)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Validation failed",
                "details": violations,
                "thread_key": thread_key,
            })),
        )
            .into_response(),
        Err(AppError::Conflict { existing_lead_id }) => {
            conflict_response(&thread_key, existing_lead_id)
        }
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

/// POST /api/v1/lead/process-async
///
/// Accepts the payload after the shallow required-field check and enqueues it.
/// No dedup pre-check here; duplicates resolve when the consumer processes
/// the message.
pub async fn process_lead_async(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
    body: Bytes,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    let payload = match parse_object_body(&body, &thread_key) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let missing = missing_required_fields(&payload);
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Missing required fields",
                "missing_fields": missing,
                "thread_key": thread_key,
            })),
        )
            .into_response();
    }

    match state.dispatcher.dispatch(&thread_key, payload, None).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "message": "Lead queued for processing",
                "status": "queued",
                "thread_key": thread_key,
            })),
        )
            .into_response(),
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

/// POST /api/v1/leads/process-bulk
///
/// Fans a `leads` array out as individual queue messages in chunks and
/// answers with the dispatch summary.
pub async fn process_bulk(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
    body: Bytes,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    let body = match parse_object_body(&body, &thread_key) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let leads = body
        .get("leads")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if leads.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Leads array is required and cannot be empty",
                "thread_key": thread_key,
            })),
        )
            .into_response();
    }

    let chunk_size = body
        .get("batch_size")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize);

    match state
        .dispatcher
        .dispatch_chunked(&thread_key, leads, chunk_size)
        .await
    {
        Ok(summary) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "message": "Leads queued for processing",
                "data": {
                    "total_leads": summary.total_leads,
                    "total_chunks": summary.total_chunks,
                    "batch_ids": summary.batch_ids,
                },
                "thread_key": thread_key,
            })),
        )
            .into_response(),
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

/// GET /api/v1/leads
pub async fn list_leads(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
    Query(params): Query<LeadFilterParams>,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    let filter = match LeadFilter::from_params(params) {
        Ok(filter) => filter,
        Err(violations) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "Bad filters were provided",
                    "details": violations,
                    "thread_key": thread_key,
                })),
            )
                .into_response();
        }
    };

    let listing = async {
        let leads = state.store.find_filtered(&filter).await?;
        let total = state.store.count_filtered(&filter).await?;
        Ok::<_, AppError>((leads, total))
    };

    match listing.await {
        Ok((leads, total)) => {
            let pages = if total == 0 {
                0
            } else {
                (total + filter.limit - 1) / filter.limit
            };
            let data: Vec<Value> = leads.iter().map(|lead| lead.to_view()).collect();

            Json(json!({
                "success": true,
                "data": data,
                "pagination": {
                    "page": filter.page,
                    "limit": filter.limit,
                    "total": total,
                    "pages": pages,
                },
                "thread_key": thread_key,
            }))
            .into_response()
        }
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

/// GET /api/v1/leads/{id}
pub async fn show_lead(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
    Path(id): Path<i64>,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    match state.store.find_by_id(id).await {
        Ok(Some(lead)) => Json(json!({
            "success": true,
            "data": lead.to_view(),
            "thread_key": thread_key,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "Lead not found",
                "thread_key": thread_key,
            })),
        )
            .into_response(),
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

/// GET /api/v1/leads/statistics
pub async fn lead_statistics(
    State(state): State<AppState>,
    thread_key: Option<Extension<ThreadKey>>,
) -> Response {
    let thread_key = resolve_thread_key(thread_key);

    match state.store.statistics().await {
        Ok(stats) => Json(json!({
            "success": true,
            "data": stats,
            "thread_key": thread_key,
        }))
        .into_response(),
        Err(e) => server_error(&state, &thread_key, e).await,
    }
}

fn conflict_response(thread_key: &str, existing_lead_id: Option<i64>) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "success": false,
            "error": "Lead with this email already exists",
            "existing_lead_id": existing_lead_id,
            "thread_key": thread_key,
        })),
    )
        .into_response()
}

async fn server_error(state: &AppState, thread_key: &str, error: AppError) -> Response {
    tracing::error!(error = %error, "Request failed");
    state
        .audit
        .log_error(thread_key, "LEAD_PROCESS_ERROR", &error, Value::Null);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": "Internal server error",
            "thread_key": thread_key,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_missing_required_fields() {
        let payload = json!({
            "firstName": "Ada",
            "lastName": "   ",
            "company": "Analytical Engines"
        });

        let missing = missing_required_fields(payload.as_object().unwrap());
        assert_eq!(missing, vec!["lastName", "email"]);
    }

    #[test]
    fn complete_payload_has_no_missing_fields() {
        let payload = json!({
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": "ada@example.com"
        });

        assert!(missing_required_fields(payload.as_object().unwrap()).is_empty());
    }

    async fn response_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn malformed_json_answers_the_error_envelope() {
        let err = parse_object_body(b"{\"email\": ", "key-1").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let body = response_json(err).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Invalid JSON payload"));
        assert_eq!(body["thread_key"], json!("key-1"));
    }

    #[tokio::test]
    async fn non_object_bodies_are_rejected_with_the_envelope() {
        for raw in [&b"[1, 2]"[..], &b"{}"[..], &b"\"text\""[..]] {
            let err = parse_object_body(raw, "key-2").unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);

            let body = response_json(err).await;
            assert_eq!(body["success"], json!(false));
            assert_eq!(body["thread_key"], json!("key-2"));
        }

        let parsed = parse_object_body(br#"{"email": "a@b.com"}"#, "key-2").unwrap();
        assert_eq!(parsed["email"], json!("a@b.com"));
    }

    #[tokio::test]
    async fn created_response_carries_the_full_fixed_record() {
        let lead = LeadWithAttributes {
            lead: crate::models::Lead {
                id: 7,
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                phone: Some("+44 20 7946 0958".to_string()),
                date_of_birth: None,
                status: "active".to_string(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            attributes: Vec::new(),
        };

        let response = created_response("key-3", &lead);
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response_json(response).await;
        assert_eq!(body["data"]["id"], json!(7));
        assert_eq!(body["data"]["firstName"], json!("Ada"));
        assert_eq!(body["data"]["lastName"], json!("Lovelace"));
        assert_eq!(body["data"]["phone"], json!("+44 20 7946 0958"));
        assert_eq!(body["data"]["status"], json!("active"));
        assert_eq!(body["thread_key"], json!("key-3"));
    }
}
