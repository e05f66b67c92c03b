//! Reservation policies — map a validated request to an outcome.
//!
//! `TierPolicy` is the stock strategy:
//! - VIP guests always get a table
//! - Regular guests and loyalty members get one with a configured probability
//! - Unrecognized tiers are answered with an error outcome
//!
//! Callers go through `decide_guarded()`, which turns policy failures and
//! panics into an error outcome so one bad request cannot take the worker down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error};

use crate::config::AcceptanceOdds;
use crate::error::{ConfigError, PolicyError};
use crate::pipeline::types::{GuestTier, ReservationOutcome, ReservationRequest};

/// Message attached to outcomes for unrecognized tiers.
pub const INVALID_GUEST_TYPE: &str = "Invalid guest type.";

/// Message attached to outcomes when the policy itself failed.
pub const PROCESSING_FAILED: &str = "An error occurred while processing the reservation.";

/// Decides the outcome of a validated reservation request.
pub trait ReservationPolicy: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &str;

    /// Decide a single request.
    fn decide(&self, request: &ReservationRequest) -> Result<ReservationOutcome, PolicyError>;
}

/// Run a policy, converting errors and panics into an `Error` outcome that
/// keeps the request id.
pub fn decide_guarded(
    policy: &dyn ReservationPolicy,
    request: &ReservationRequest,
) -> ReservationOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| policy.decide(request))).unwrap_or_else(
        |payload| {
            Err(PolicyError::Panicked {
                policy: policy.name().to_string(),
                reason: panic_message(payload.as_ref()),
            })
        },
    );

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                reservation_id = %request.reservation_id,
                error = %e,
                "Reservation policy failed"
            );
            ReservationOutcome::error(&request.reservation_id, PROCESSING_FAILED)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Tier policy ─────────────────────────────────────────────────────

/// Probabilistic tier-based acceptance.
pub struct TierPolicy {
    odds: AcceptanceOdds,
    rng: Mutex<StdRng>,
}

impl TierPolicy {
    /// Create a policy seeded from OS entropy.
    pub fn new(odds: AcceptanceOdds) -> Result<Self, ConfigError> {
        Self::with_rng(odds, StdRng::from_entropy())
    }

    /// Create a policy with a fixed seed (reproducible decisions).
    pub fn seeded(odds: AcceptanceOdds, seed: u64) -> Result<Self, ConfigError> {
        Self::with_rng(odds, StdRng::seed_from_u64(seed))
    }

    fn with_rng(odds: AcceptanceOdds, rng: StdRng) -> Result<Self, ConfigError> {
        odds.validate()?;
        Ok(Self {
            odds,
            rng: Mutex::new(rng),
        })
    }

    /// Configured odds.
    pub fn odds(&self) -> AcceptanceOdds {
        self.odds
    }

    fn roll(&self, probability: f64) -> Result<bool, PolicyError> {
        let mut rng = self.rng.lock().map_err(|_| PolicyError::Failed {
            policy: self.name().to_string(),
            reason: "random source poisoned".into(),
        })?;
        Ok(rng.gen_bool(probability))
    }
}

impl ReservationPolicy for TierPolicy {
    fn name(&self) -> &str {
        "tier"
    }

    fn decide(&self, request: &ReservationRequest) -> Result<ReservationOutcome, PolicyError> {
        let id = request.reservation_id.as_str();
        debug!(reservation_id = %id, tier = %request.guest_type, "Deciding reservation");

        let outcome = match &request.guest_type {
            GuestTier::Vip => ReservationOutcome::success(id, "VIP table successfully reserved."),
            GuestTier::Regular => {
                if self.roll(self.odds.regular)? {
                    ReservationOutcome::success(id, "Regular table successfully reserved.")
                } else {
                    ReservationOutcome::no_table(id, "No table available for regular guest.")
                }
            }
            GuestTier::Loyalty => {
                if self.roll(self.odds.loyalty)? {
                    ReservationOutcome::success(id, "Loyalty member table successfully reserved.")
                } else {
                    ReservationOutcome::no_table(id, "No table available for loyalty member.")
                }
            }
            GuestTier::Other(_) => ReservationOutcome::error(id, INVALID_GUEST_TYPE),
        };

        Ok(outcome)
    }
}
