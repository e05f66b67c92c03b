//! Structural validation of inbound reservation payloads.
//!
//! Two gates, both pure:
//! 1. `parse()` — bytes must be a UTF-8 JSON object
//! 2. `validate()` — the seven required fields must be present
//!
//! Values are not range-checked here. A party size of `0` or an unknown
//! guest tier passes through and is judged by the policy.

use serde_json::{Map, Value};

use crate::error::MessageError;
use crate::pipeline::types::{GuestTier, PartySize, ReservationRequest};

/// Fields every request must carry, in declaration order.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "reservation_id",
    "user_id",
    "restaurant_id",
    "date",
    "time",
    "party_size",
    "guest_type",
];

/// Decode a delivery body into a JSON object.
pub fn parse(payload: &[u8]) -> Result<Map<String, Value>, MessageError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| MessageError::Parse(format!("invalid UTF-8: {e}")))?;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(MessageError::Parse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(MessageError::Parse(e.to_string())),
    }
}

/// Check required fields and build a typed request.
///
/// A field counts as missing when absent, `null`, or an empty string.
/// Every missing field is reported, not just the first.
pub fn validate(mut map: Map<String, Value>) -> Result<ReservationRequest, MessageError> {
    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| map.get(*field).is_none_or(is_blank))
        .collect();

    if !missing.is_empty() {
        return Err(MessageError::MissingFields(missing));
    }

    let mut take = |field: &str| map.remove(field).unwrap_or(Value::Null);

    let reservation_id = text(take("reservation_id"));
    let user_id = text(take("user_id"));
    let restaurant_id = text(take("restaurant_id"));
    let date = text(take("date"));
    let time = text(take("time"));
    let party_size = PartySize(take("party_size"));
    let guest_type = GuestTier::from_label(&text(take("guest_type")));

    Ok(ReservationRequest {
        reservation_id,
        user_id,
        restaurant_id,
        date,
        time,
        party_size,
        guest_type,
        extras: map,
    })
}

/// `parse` followed by `validate`.
pub fn validate_payload(payload: &[u8]) -> Result<ReservationRequest, MessageError> {
    validate(parse(payload)?)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// String fields keep their text; other scalars use their JSON form.
fn text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
