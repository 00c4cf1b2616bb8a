use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Fixed lead fields; everything else in a payload becomes a dynamic attribute.
pub const FIXED_FIELDS: [&str; 6] = [
    "firstName",
    "lastName",
    "email",
    "phone",
    "dateOfBirth",
    "status",
];

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static DATETIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").unwrap());

/// Type tag governing how a dynamic attribute value round-trips through its
/// canonical text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Json => "json",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(FieldType::String),
            "integer" => Ok(FieldType::Integer),
            "float" => Ok(FieldType::Float),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "datetime" => Ok(FieldType::Datetime),
            "json" => Ok(FieldType::Json),
            other => Err(format!("unknown field type '{}'", other)),
        }
    }
}

/// A dynamic attribute extracted from a lead payload, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicField {
    pub field_name: String,
    pub field_value: String,
    pub field_type: FieldType,
}

/// Infers the type tag for a raw payload value.
///
/// Precedence is boolean → integer → float → structured (json) → date pattern
/// → datetime pattern → string. A plain string that happens to match the date
/// pattern (for instance a digits-dash-digits product code) is typed `date`;
/// this ambiguity is deliberate and kept deterministic.
pub fn infer_field_type(value: &Value) -> FieldType {
    match value {
        Value::Bool(_) => FieldType::Boolean,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                FieldType::Integer
            } else {
                FieldType::Float
            }
        }
        Value::Array(_) | Value::Object(_) => FieldType::Json,
        Value::String(s) => {
            if DATE_RE.is_match(s) {
                FieldType::Date
            } else if DATETIME_RE.is_match(s) {
                FieldType::Datetime
            } else {
                FieldType::String
            }
        }
        Value::Null => FieldType::String,
    }
}

/// Serializes a payload value to its canonical stored text.
///
/// Booleans become `"1"`/`"0"`, structured values compact JSON, everything
/// else the unquoted string form. Date and datetime values arrive as strings
/// already in their fixed format and pass through unchanged.
pub fn encode_field_value(value: &Value, field_type: FieldType) -> String {
    match field_type {
        FieldType::Boolean => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::String(s) => parse_truthy(s),
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => false,
            };
            if truthy { "1" } else { "0" }.to_string()
        }
        FieldType::Json => serde_json::to_string(value).unwrap_or_default(),
        _ => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Decodes stored text back into its logical value (`typed_value`).
///
/// Falls back to the raw string whenever the stored text does not parse under
/// its type tag, so a decode never fails.
pub fn decode_field_value(stored: &str, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Integer => stored
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(stored.to_string())),
        FieldType::Float => stored
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(stored.to_string())),
        FieldType::Boolean => Value::Bool(parse_truthy(stored)),
        // Dates and datetimes stay in their fixed-format string form.
        FieldType::Date | FieldType::Datetime => Value::String(stored.to_string()),
        FieldType::Json => serde_json::from_str(stored)
            .unwrap_or_else(|_| Value::String(stored.to_string())),
        FieldType::String => Value::String(stored.to_string()),
    }
}

/// Permissive truthy parse matching the stored `"1"`/`"0"` encoding plus the
/// usual textual spellings.
fn parse_truthy(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Splits a flat payload into its fixed fields and typed dynamic attributes.
///
/// Null-valued dynamic keys are dropped; they carry no information and the
/// store treats a missing row and a null value identically.
pub fn partition_payload(
    payload: &Map<String, Value>,
) -> (Map<String, Value>, Vec<DynamicField>) {
    let mut fixed = Map::new();
    let mut dynamic = Vec::new();

    for (key, value) in payload {
        if FIXED_FIELDS.contains(&key.as_str()) {
            fixed.insert(key.clone(), value.clone());
        } else if !value.is_null() {
            let field_type = infer_field_type(value);
            dynamic.push(DynamicField {
                field_name: key.clone(),
                field_value: encode_field_value(value, field_type),
                field_type,
            });
        }
    }

    (fixed, dynamic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_native_types_before_patterns() {
        assert_eq!(infer_field_type(&json!(true)), FieldType::Boolean);
        assert_eq!(infer_field_type(&json!(42)), FieldType::Integer);
        assert_eq!(infer_field_type(&json!(3.25)), FieldType::Float);
        assert_eq!(infer_field_type(&json!([1, 2])), FieldType::Json);
        assert_eq!(infer_field_type(&json!({"a": 1})), FieldType::Json);
    }

    #[test]
    fn infers_string_patterns() {
        assert_eq!(infer_field_type(&json!("2024-01-15")), FieldType::Date);
        assert_eq!(
            infer_field_type(&json!("2024-01-15 10:30:00")),
            FieldType::Datetime
        );
        assert_eq!(
            infer_field_type(&json!("2024-01-15T10:30:00")),
            FieldType::Datetime
        );
        assert_eq!(infer_field_type(&json!("plain text")), FieldType::String);
    }

    #[test]
    fn date_shaped_strings_are_typed_date() {
        // Documented ambiguity: a product code shaped like a date is inferred
        // as a date. The inference must stay deterministic.
        assert_eq!(infer_field_type(&json!("2024-11-30")), FieldType::Date);
    }

    #[test]
    fn boolean_round_trip() {
        assert_eq!(encode_field_value(&json!(true), FieldType::Boolean), "1");
        assert_eq!(encode_field_value(&json!(false), FieldType::Boolean), "0");
        assert_eq!(decode_field_value("1", FieldType::Boolean), json!(true));
        assert_eq!(decode_field_value("0", FieldType::Boolean), json!(false));
        assert_eq!(decode_field_value("yes", FieldType::Boolean), json!(true));
        assert_eq!(decode_field_value("off", FieldType::Boolean), json!(false));
    }

    #[test]
    fn json_round_trip_reconstructs_structure() {
        let value = json!({"nested": {"a": [1, 2, 3]}, "b": "x"});
        let encoded = encode_field_value(&value, FieldType::Json);
        assert_eq!(decode_field_value(&encoded, FieldType::Json), value);
    }

    #[test]
    fn numeric_round_trips() {
        assert_eq!(encode_field_value(&json!(42), FieldType::Integer), "42");
        assert_eq!(decode_field_value("42", FieldType::Integer), json!(42));
        assert_eq!(encode_field_value(&json!(3.5), FieldType::Float), "3.5");
        assert_eq!(decode_field_value("3.5", FieldType::Float), json!(3.5));
    }

    #[test]
    fn unparseable_stored_text_falls_back_to_string() {
        assert_eq!(
            decode_field_value("not-a-number", FieldType::Integer),
            json!("not-a-number")
        );
        assert_eq!(
            decode_field_value("{broken", FieldType::Json),
            json!("{broken")
        );
    }

    #[test]
    fn partition_separates_fixed_and_dynamic() {
        let payload = json!({
            "firstName": "Ada",
            "email": "ada@example.com",
            "company": "Analytical Engines",
            "score": 87,
            "ignored": null
        });
        let (fixed, dynamic) = partition_payload(payload.as_object().unwrap());

        assert_eq!(fixed.len(), 2);
        assert!(fixed.contains_key("firstName"));
        assert_eq!(dynamic.len(), 2);

        let company = dynamic.iter().find(|d| d.field_name == "company").unwrap();
        assert_eq!(company.field_type, FieldType::String);
        assert_eq!(company.field_value, "Analytical Engines");

        let score = dynamic.iter().find(|d| d.field_name == "score").unwrap();
        assert_eq!(score.field_type, FieldType::Integer);
        assert_eq!(score.field_value, "87");
    }

    #[test]
    fn field_type_string_round_trip() {
        for ft in [
            FieldType::String,
            FieldType::Integer,
            FieldType::Float,
            FieldType::Boolean,
            FieldType::Date,
            FieldType::Datetime,
            FieldType::Json,
        ] {
            assert_eq!(ft.as_str().parse::<FieldType>().unwrap(), ft);
        }
    }
}
