//! Reservation worker — consumes reservation requests from durable queues,
//! decides them per guest tier, and publishes outcomes.

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
