/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use proptest::prelude::*;
use serde_json::{json, Value};

use lead_intake_api::attributes::{
    decode_field_value, encode_field_value, infer_field_type, FieldType,
};
use lead_intake_api::audit::generate_thread_key;
use lead_intake_api::dispatch::clamp_chunk_size;
use lead_intake_api::processor::is_valid_email;

// Property: type inference and encoding never panic
proptest! {
    #[test]
    fn inference_never_panics_on_strings(s in "\\PC*") {
        let _ = infer_field_type(&json!(s));
    }

    #[test]
    fn encoding_any_string_is_lossless(s in "\\PC*") {
        let value = json!(s);
        let field_type = infer_field_type(&value);
        let encoded = encode_field_value(&value, field_type);
        // Strings that infer as plain strings survive the round trip exactly
        if field_type == FieldType::String {
            prop_assert_eq!(decode_field_value(&encoded, field_type), value);
        }
    }
}

// Property: scalar round trips through the canonical text encoding
proptest! {
    #[test]
    fn integers_round_trip(n in any::<i64>()) {
        let value = json!(n);
        prop_assert_eq!(infer_field_type(&value), FieldType::Integer);

        let encoded = encode_field_value(&value, FieldType::Integer);
        prop_assert_eq!(decode_field_value(&encoded, FieldType::Integer), value);
    }

    #[test]
    fn booleans_encode_to_one_or_zero(b in proptest::bool::ANY) {
        let value = json!(b);
        let encoded = encode_field_value(&value, FieldType::Boolean);
        prop_assert!(encoded == "1" || encoded == "0");
        prop_assert_eq!(decode_field_value(&encoded, FieldType::Boolean), value);
    }

    #[test]
    fn finite_floats_round_trip(f in proptest::num::f64::NORMAL) {
        let value = json!(f);
        let encoded = encode_field_value(&value, FieldType::Float);
        if let Value::Number(decoded) = decode_field_value(&encoded, FieldType::Float) {
            prop_assert_eq!(decoded.as_f64().unwrap(), f);
        } else {
            prop_assert!(false, "float did not decode to a number");
        }
    }
}

// Property: date-shaped strings are the only strings inferred as dates
proptest! {
    #[test]
    fn date_shaped_strings_infer_as_date(
        year in 1900u32..=2100u32,
        month in 1u32..=12u32,
        day in 1u32..=28u32
    ) {
        let value = json!(format!("{:04}-{:02}-{:02}", year, month, day));
        prop_assert_eq!(infer_field_type(&value), FieldType::Date);
    }

    #[test]
    fn alphabetic_strings_infer_as_string(s in "[a-zA-Z ]{1,40}") {
        prop_assert_eq!(infer_field_type(&json!(s)), FieldType::String);
    }
}

// Property: email validation never panics and respects basic structure
proptest! {
    #[test]
    fn email_validation_never_panics(email in "\\PC*") {
        let _ = is_valid_email(&email);
    }

    #[test]
    fn emails_without_at_sign_rejected(s in "[a-z0-9.]{1,30}") {
        prop_assert!(!is_valid_email(&s));
    }
}

// Property: bulk chunk sizing stays within its bounds
proptest! {
    #[test]
    fn chunk_size_always_in_bounds(requested in proptest::option::of(any::<usize>())) {
        let size = clamp_chunk_size(requested);
        prop_assert!((1..=100).contains(&size));
    }

    #[test]
    fn chunk_count_is_ceiling(total in 1usize..=500, size in 1usize..=100) {
        let leads: Vec<Value> = (0..total).map(|i| json!({"email": format!("u{}@x.com", i)})).collect();
        let chunks = leads.chunks(size).count();
        prop_assert_eq!(chunks, total.div_ceil(size));
    }
}

// Property: thread keys keep their three-segment shape
proptest! {
    #[test]
    fn thread_keys_keep_their_shape(_seed in any::<u8>()) {
        let key = generate_thread_key();
        let parts: Vec<&str> = key.split('-').collect();
        prop_assert_eq!(parts.len(), 3);
        prop_assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        prop_assert_eq!(parts[1].len(), 6);
        prop_assert_eq!(parts[2].len(), 10);
    }
}
