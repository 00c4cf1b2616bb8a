use crate::attributes::{decode_field_value, FieldType};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

/// Allowed lead lifecycle statuses.
pub const LEAD_STATUSES: [&str; 4] = ["active", "inactive", "converted", "invalid"];

// ============ Database Models ============

/// A lead's fixed identity and contact record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    /// Unique identifier, assigned on creation.
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    /// Globally unique, case-sensitive as stored.
    pub email: String,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    /// One of [`LEAD_STATUSES`], defaults to `active`.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dynamic attribute row; unique per (lead, field name).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadAttribute {
    pub id: i64,
    pub lead_id: i64,
    pub field_name: String,
    /// Canonical text encoding; `field_type` governs decoding.
    pub field_value: Option<String>,
    pub field_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadAttribute {
    /// The stored text decoded under its type tag.
    pub fn typed_value(&self) -> Value {
        let field_type = self
            .field_type
            .parse::<FieldType>()
            .unwrap_or(FieldType::String);

        match &self.field_value {
            Some(stored) => decode_field_value(stored, field_type),
            None => Value::Null,
        }
    }
}

/// A lead aggregate: the fixed record plus its dynamic attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadWithAttributes {
    #[serde(flatten)]
    pub lead: Lead,
    pub attributes: Vec<LeadAttribute>,
}

impl LeadWithAttributes {
    /// API representation: lead fields plus decoded dynamic data.
    pub fn to_view(&self) -> Value {
        let mut view = serde_json::to_value(&self.lead)
            .unwrap_or(Value::Null);

        let dynamic: Vec<Value> = self
            .attributes
            .iter()
            .map(|attr| {
                serde_json::json!({
                    "fieldName": attr.field_name,
                    "fieldValue": attr.field_value,
                    "fieldType": attr.field_type,
                    "typedValue": attr.typed_value(),
                })
            })
            .collect();

        if let Value::Object(map) = &mut view {
            map.insert("dynamicData".to_string(), Value::Array(dynamic));
        }

        view
    }
}

/// A validated, normalized lead ready for insertion.
#[derive(Debug, Clone)]
pub struct NewLead {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub status: String,
}

/// A dynamic attribute ready for insertion alongside a [`NewLead`].
#[derive(Debug, Clone)]
pub struct NewAttribute {
    pub field_name: String,
    pub field_value: String,
    pub field_type: FieldType,
}

// ============ Query Models ============

/// Normalized listing filter; construct via [`LeadFilter::from_params`] so the
/// page/limit bounds are always applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadFilter {
    pub page: i64,
    pub limit: i64,
    pub status: Option<String>,
    pub email: Option<String>,
    pub search: Option<String>,
}

impl Default for LeadFilter {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            status: None,
            email: None,
            search: None,
        }
    }
}

/// Raw query parameters for the listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadFilterParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
    pub email: Option<String>,
    pub search: Option<String>,
}

impl LeadFilter {
    /// Clamps page to at least 1 and limit to 1..=100, then validates the
    /// remaining filters. Returns every violation found.
    pub fn from_params(params: LeadFilterParams) -> Result<Self, Vec<String>> {
        let filter = Self {
            page: params.page.unwrap_or(1).max(1),
            limit: params.limit.unwrap_or(20).clamp(1, 100),
            status: params.status.filter(|s| !s.is_empty()),
            email: params.email.filter(|s| !s.is_empty()),
            search: params.search.filter(|s| !s.is_empty()),
        };

        let mut violations = Vec::new();

        if let Some(status) = &filter.status {
            if !LEAD_STATUSES.contains(&status.as_str()) {
                violations.push(format!("Invalid status filter '{}'.", status));
            }
        }
        if let Some(search) = &filter.search {
            if search.len() > 100 {
                violations.push("Search term cannot be longer than 100 characters.".to_string());
            }
        }

        if violations.is_empty() {
            Ok(filter)
        } else {
            Err(violations)
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

/// Aggregate lead counts, cached per calendar day.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadStatistics {
    pub total: i64,
    pub active: i64,
    pub converted: i64,
    pub inactive: i64,
    pub today: i64,
}

// ============ Wire Models ============

/// Unit of async work published per lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLeadMessage {
    /// Flat lead payload; bulk submissions are flattened before publishing.
    pub lead_payload: Map<String, Value>,
    /// Chunk correlation id, `<unixTimestamp>_<chunkIndex>`. Observability
    /// only; not used for dedup or ordering.
    pub batch_id: Option<String>,
}

/// Result of fanning a bulk submission out onto the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub total_leads: usize,
    pub total_chunks: usize,
    pub batch_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_clamps_page_and_limit() {
        let filter = LeadFilter::from_params(LeadFilterParams {
            page: Some(-3),
            limit: Some(5000),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, 100);
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn filter_rejects_unknown_status() {
        let err = LeadFilter::from_params(LeadFilterParams {
            status: Some("archived".to_string()),
            ..Default::default()
        })
        .unwrap_err();

        assert_eq!(err.len(), 1);
        assert!(err[0].contains("archived"));
    }

    #[test]
    fn attribute_typed_value_decodes_under_tag() {
        let attr = LeadAttribute {
            id: 1,
            lead_id: 1,
            field_name: "newsletter".to_string(),
            field_value: Some("1".to_string()),
            field_type: "boolean".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(attr.typed_value(), json!(true));
    }

    #[test]
    fn process_lead_message_uses_camel_case_wire_shape() {
        let mut payload = Map::new();
        payload.insert("email".to_string(), json!("a@b.com"));
        let msg = ProcessLeadMessage {
            lead_payload: payload,
            batch_id: Some("1700000000_0".to_string()),
        };

        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("leadPayload").is_some());
        assert_eq!(wire["batchId"], json!("1700000000_0"));
    }
}
