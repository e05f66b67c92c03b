//! Shared types for the reservation pipeline.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ── Guest tier ──────────────────────────────────────────────────────

/// Guest tier carried in `guest_type`.
///
/// Labels the worker does not recognize are kept verbatim so the policy can
/// answer them with an error outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GuestTier {
    Regular,
    Vip,
    Loyalty,
    Other(String),
}

impl GuestTier {
    /// Wire label for this tier.
    pub fn label(&self) -> &str {
        match self {
            Self::Regular => "Regular Guest",
            Self::Vip => "VIP Guest",
            Self::Loyalty => "Loyalty Program Member",
            Self::Other(label) => label,
        }
    }

    /// Map a wire label to a tier. Matching is exact.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Regular Guest" => Self::Regular,
            "VIP Guest" => Self::Vip,
            "Loyalty Program Member" => Self::Loyalty,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this is one of the known tiers.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl std::fmt::Display for GuestTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for GuestTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for GuestTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

// ── Party size ──────────────────────────────────────────────────────

/// Party size exactly as received.
///
/// Validation only guarantees presence; interpretation is left to the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartySize(pub Value);

impl PartySize {
    /// The size as a positive integer, if the value holds one.
    /// Numeric strings such as `"4"` are accepted.
    pub fn count(&self) -> Option<u32> {
        let n = match &self.0 {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };
        u32::try_from(n).ok().filter(|n| *n > 0)
    }
}

impl From<u32> for PartySize {
    fn from(n: u32) -> Self {
        Self(Value::from(n))
    }
}

// ── Request ─────────────────────────────────────────────────────────

/// A reservation request that passed structural validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub reservation_id: String,
    pub user_id: String,
    pub restaurant_id: String,
    pub date: String,
    pub time: String,
    pub party_size: PartySize,
    pub guest_type: GuestTier,
    /// Optional fields (preferences, contact info, ...) passed through untouched.
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl ReservationRequest {
    /// Build a request with no optional fields.
    pub fn new(
        reservation_id: impl Into<String>,
        user_id: impl Into<String>,
        restaurant_id: impl Into<String>,
        date: impl Into<String>,
        time: impl Into<String>,
        party_size: impl Into<PartySize>,
        guest_type: GuestTier,
    ) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            user_id: user_id.into(),
            restaurant_id: restaurant_id.into(),
            date: date.into(),
            time: time.into(),
            party_size: party_size.into(),
            guest_type,
            extras: Map::new(),
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Terminal status of a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Success,
    NoTableAvailable,
    Error,
}

impl ReservationStatus {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NoTableAvailable => "NO_TABLE_AVAILABLE",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome published to the results queue, one per validated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub reservation_id: String,
    pub status: ReservationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReservationOutcome {
    pub fn new(
        reservation_id: impl Into<String>,
        status: ReservationStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            status,
            message: Some(message.into()),
        }
    }

    pub fn success(reservation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(reservation_id, ReservationStatus::Success, message)
    }

    pub fn no_table(reservation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(reservation_id, ReservationStatus::NoTableAvailable, message)
    }

    pub fn error(reservation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(reservation_id, ReservationStatus::Error, message)
    }
}

/// Legacy notice sent to the side-channel queue after a successful ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessNotice {
    pub status: ReservationStatus,
    pub message: String,
}

impl Default for SuccessNotice {
    fn default() -> Self {
        Self {
            status: ReservationStatus::Success,
            message: "VIP table successfully reserved.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(ReservationStatus::Success).unwrap(),
            "SUCCESS"
        );
        assert_eq!(
            serde_json::to_value(ReservationStatus::NoTableAvailable).unwrap(),
            "NO_TABLE_AVAILABLE"
        );
        assert_eq!(
            serde_json::to_value(ReservationStatus::Error).unwrap(),
            "ERROR"
        );
    }

    #[test]
    fn outcome_round_trips_for_every_status() {
        for status in [
            ReservationStatus::Success,
            ReservationStatus::NoTableAvailable,
            ReservationStatus::Error,
        ] {
            let outcome = ReservationOutcome::new("r1", status, "done");
            let json = serde_json::to_string(&outcome).unwrap();
            let back: ReservationOutcome = serde_json::from_str(&json).unwrap();
            assert_eq!(back, outcome);
        }
    }

    #[test]
    fn outcome_without_message_omits_field() {
        let outcome = ReservationOutcome {
            reservation_id: "r2".into(),
            status: ReservationStatus::Success,
            message: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("message").is_none());
        let back: ReservationOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn guest_tier_labels() {
        assert_eq!(GuestTier::from_label("VIP Guest"), GuestTier::Vip);
        assert_eq!(GuestTier::from_label("Regular Guest"), GuestTier::Regular);
        assert_eq!(
            GuestTier::from_label("Loyalty Program Member"),
            GuestTier::Loyalty
        );
        let other = GuestTier::from_label("vip guest");
        assert_eq!(other, GuestTier::Other("vip guest".into()));
        assert!(!other.is_recognized());
        assert_eq!(other.label(), "vip guest");
    }

    #[test]
    fn party_size_count() {
        assert_eq!(PartySize::from(4u32).count(), Some(4));
        assert_eq!(PartySize(Value::from("6")).count(), Some(6));
        assert_eq!(PartySize(Value::from(0)).count(), None);
        assert_eq!(PartySize(Value::from(-2)).count(), None);
        assert_eq!(PartySize(Value::from(2.5)).count(), None);
        assert_eq!(PartySize(Value::from("two")).count(), None);
    }

    #[test]
    fn request_serializes_extras_inline() {
        let mut request = ReservationRequest::new(
            "r1",
            "u1",
            "b1",
            "2024-01-01",
            "19:00",
            2u32,
            GuestTier::Loyalty,
        );
        request
            .extras
            .insert("special_requests".into(), Value::from("window seat"));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["guest_type"], "Loyalty Program Member");
        assert_eq!(json["party_size"], 2);
        assert_eq!(json["special_requests"], "window seat");
    }

    #[test]
    fn success_notice_payload() {
        let json = serde_json::to_value(SuccessNotice::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "SUCCESS", "message": "VIP table successfully reserved."})
        );
    }
}
