use crate::attributes::{partition_payload, DynamicField};
use crate::errors::AppError;
use crate::models::{LeadWithAttributes, NewAttribute, NewLead, LEAD_STATUSES};
use crate::store::LeadStore;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[\d\-\(\)\s]+$").unwrap());

// RFC 5322 simplified email regex
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .unwrap()
});

/// The single choke point both the synchronous endpoint and the queue
/// consumer go through: normalization, validation, and the atomic store
/// write, with identical semantics on both paths.
pub struct LeadProcessor {
    store: Arc<LeadStore>,
}

impl LeadProcessor {
    pub fn new(store: Arc<LeadStore>) -> Self {
        Self { store }
    }

    /// Processes a flat lead payload into a persisted lead aggregate.
    ///
    /// Returns `AppError::Validation` listing every violation when the input
    /// is bad (nothing is written in that case), `AppError::Conflict` when
    /// the email already exists, and propagates store errors otherwise.
    pub async fn process(
        &self,
        payload: &Map<String, Value>,
    ) -> Result<LeadWithAttributes, AppError> {
        let (new_lead, attributes) = normalize_and_validate(payload)?;

        self.store
            .insert_lead_with_attributes(&new_lead, &attributes)
            .await
    }
}

/// Normalizes a flat payload and validates the result.
///
/// String fields are trimmed (dates excepted), status defaults to `active`,
/// and every non-fixed key becomes a typed dynamic attribute. All violations
/// are aggregated into one error rather than failing on the first.
pub fn normalize_and_validate(
    payload: &Map<String, Value>,
) -> Result<(NewLead, Vec<NewAttribute>), AppError> {
    let (fixed, dynamic) = partition_payload(payload);
    let mut violations = Vec::new();

    let first_name = trimmed_string(&fixed, "firstName");
    let last_name = trimmed_string(&fixed, "lastName");
    let email = trimmed_string(&fixed, "email");
    let phone = trimmed_string(&fixed, "phone");
    let status = trimmed_string(&fixed, "status").unwrap_or_else(|| "active".to_string());
    // Date fields are not trimmed; they must already be in their fixed shape.
    let date_of_birth_raw = fixed
        .get("dateOfBirth")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match &first_name {
        None => violations.push("First name is required.".to_string()),
        Some(name) if name.len() > 100 => {
            violations.push("First name cannot be longer than 100 characters.".to_string())
        }
        _ => {}
    }

    match &last_name {
        None => violations.push("Last name is required.".to_string()),
        Some(name) if name.len() > 100 => {
            violations.push("Last name cannot be longer than 100 characters.".to_string())
        }
        _ => {}
    }

    match &email {
        None => violations.push("Email is required.".to_string()),
        Some(addr) if addr.len() > 255 => {
            violations.push("Email cannot be longer than 255 characters.".to_string())
        }
        Some(addr) if !is_valid_email(addr) => {
            violations.push(format!("The email '{}' is not a valid email.", addr))
        }
        _ => {}
    }

    if let Some(number) = &phone {
        if number.len() > 20 {
            violations.push("Phone number cannot be longer than 20 characters.".to_string());
        } else if !PHONE_RE.is_match(number) {
            violations.push("Invalid phone number format.".to_string());
        }
    }

    let date_of_birth = match &date_of_birth_raw {
        None => None,
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                violations.push("Date of birth must be a valid date.".to_string());
                None
            }
        },
    };

    if !LEAD_STATUSES.contains(&status.as_str()) {
        violations.push("Invalid status type.".to_string());
    }

    for field in &dynamic {
        if field.field_name.trim().is_empty() {
            violations.push("Dynamic field name is required.".to_string());
        } else if field.field_name.len() > 100 {
            violations.push(format!(
                "Dynamic field name '{}' cannot be longer than 100 characters.",
                field.field_name
            ));
        }
    }

    if !violations.is_empty() {
        return Err(AppError::Validation(violations));
    }

    let new_lead = NewLead {
        // Required fields are proven present once violations are empty.
        first_name: first_name.unwrap_or_default(),
        last_name: last_name.unwrap_or_default(),
        email: email.unwrap_or_default(),
        phone,
        date_of_birth,
        status,
    };

    let attributes = dynamic.into_iter().map(to_new_attribute).collect();

    Ok((new_lead, attributes))
}

fn to_new_attribute(field: DynamicField) -> NewAttribute {
    NewAttribute {
        field_name: field.field_name,
        field_value: field.field_value,
        field_type: field.field_type,
    }
}

fn trimmed_string(fixed: &Map<String, Value>, key: &str) -> Option<String> {
    fixed
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    EMAIL_RE.is_match(email)
}
