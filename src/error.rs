//! Error types for the reservation worker.

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Broker interaction errors.
///
/// Every broker call is converted into one of these at the call site so a
/// failure never escapes into a consumer task.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Cannot connect to broker: {reason}")]
    Connection { reason: String },

    #[error("No active broker connection")]
    NotConnected,

    #[error("Queue {queue} could not be declared: {reason}")]
    Declaration { queue: String, reason: String },

    #[error("Failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Failed to subscribe to queue {queue}: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("Failed to settle delivery {tag}: {reason}")]
    Settle { tag: u64, reason: String },

    #[error("Delivery {tag} is unknown or already settled")]
    UnknownDelivery { tag: u64 },

    #[error("Delivery {tag} belongs to a closed session")]
    StaleDelivery { tag: u64 },

    #[error("Failed to close broker connection: {reason}")]
    Close { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Inbound message errors. Both variants lead to a discard without requeue.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Unparsable message body: {0}")]
    Parse(String),

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Failures inside a reservation policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy {policy} failed: {reason}")]
    Failed { policy: String, reason: String },

    #[error("Policy {policy} panicked: {reason}")]
    Panicked { policy: String, reason: String },
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
