//! Reservation processing pipeline.
//!
//! Every delivery from an input queue flows through:
//! 1. `validator::parse()` / `validator::validate()` — structural checks, pure
//! 2. `policy::decide_guarded()` — pluggable decision, never fails
//! 3. `Dispatcher` — publishes the outcome and settles the delivery
//!
//! **Invalid messages are never answered.** They are nacked without requeue.

pub mod dispatcher;
pub mod policy;
pub mod types;
pub mod validator;

pub use dispatcher::{Dispatcher, Disposition, RejectReason};
pub use policy::{ReservationPolicy, TierPolicy, decide_guarded};
pub use types::{GuestTier, PartySize, ReservationOutcome, ReservationRequest, ReservationStatus};
