//! Configuration types, built from environment variables.

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::ConfigError;

/// Queue carrying regular guest requests.
pub const REGULAR_QUEUE: &str = "regular_guest_processing_queue";
/// Queue carrying VIP guest requests.
pub const VIP_QUEUE: &str = "vip_guest_processing_queue";
/// Queue carrying loyalty member requests.
pub const LOYALTY_QUEUE: &str = "loyalty_member_processing_queue";
/// Queue receiving one outcome per validated request.
pub const RESULTS_QUEUE: &str = "booking_processing_results";
/// Legacy side channel fed on every successful ack.
pub const SUCCESS_NOTICE_QUEUE: &str = "success_results_queue";

/// Default `basic.qos` prefetch per channel.
const DEFAULT_PREFETCH: u16 = 16;

// ── Broker ──────────────────────────────────────────────────────────

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Full AMQP URI. When set, the individual fields are ignored.
    pub url: Option<SecretString>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub vhost: String,
}

impl BrokerConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("AMQP_URL")
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let host = lookup("RABBITMQ_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = parse_or("PORT_RABBITMQ", lookup("PORT_RABBITMQ"), 5672u16)?;
        let username = lookup("RABBITMQ_USER").unwrap_or_else(|| "guest".to_string());
        let password =
            SecretString::from(lookup("RABBITMQ_PASS").unwrap_or_else(|| "guest".to_string()));
        let vhost = lookup("RABBITMQ_VHOST").unwrap_or_else(|| "/".to_string());

        Ok(Self {
            url,
            host,
            port,
            username,
            password,
            vhost,
        })
    }

    /// Connection URI handed to the client. Contains the password.
    ///
    /// Credentials and vhost are percent-encoded.
    pub fn uri(&self) -> Result<SecretString, ConfigError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "RABBITMQ_HOST".to_string(),
            message,
        };

        let mut uri = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| invalid(e.to_string()))?;
        uri.set_username(&self.username)
            .map_err(|()| invalid("host does not accept credentials".to_string()))?;
        uri.set_password(Some(self.password.expose_secret()))
            .map_err(|()| invalid("host does not accept credentials".to_string()))?;

        let vhost = match self.vhost.trim_start_matches('/') {
            "" => "%2f".to_string(),
            name => name.replace('/', "%2f"),
        };
        uri.set_path(&format!("/{vhost}"));

        Ok(SecretString::from(String::from(uri)))
    }

    /// Endpoint description safe for logs.
    pub fn endpoint(&self) -> String {
        if self.url.is_some() {
            return "AMQP_URL".to_string();
        }
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }
}

// ── Worker ──────────────────────────────────────────────────────────

/// Acceptance probabilities for the non-VIP tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceOdds {
    /// Probability a regular guest gets a table.
    pub regular: f64,
    /// Probability a loyalty member gets a table.
    pub loyalty: f64,
}

impl Default for AcceptanceOdds {
    fn default() -> Self {
        Self {
            regular: 0.5,
            loyalty: 0.7,
        }
    }
}

impl AcceptanceOdds {
    /// Reject probabilities outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("regular", self.regular), ("loyalty", self.loyalty)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key} acceptance"),
                    message: format!("{value} is not a probability"),
                });
            }
        }
        Ok(())
    }
}

/// Worker routing and policy settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to consume reservation requests from.
    pub input_queues: Vec<String>,
    /// Queue receiving outcomes.
    pub results_queue: String,
    /// Side-channel queue for ack notices (`None` = disabled).
    pub success_notice_queue: Option<String>,
    /// Unacknowledged deliveries allowed in flight (0 = unlimited).
    pub prefetch: u16,
    /// Tier acceptance odds.
    pub odds: AcceptanceOdds,
    /// Fixed seed for the decision RNG.
    pub policy_seed: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            input_queues: vec![
                REGULAR_QUEUE.to_string(),
                VIP_QUEUE.to_string(),
                LOYALTY_QUEUE.to_string(),
            ],
            results_queue: RESULTS_QUEUE.to_string(),
            success_notice_queue: Some(SUCCESS_NOTICE_QUEUE.to_string()),
            prefetch: DEFAULT_PREFETCH,
            odds: AcceptanceOdds::default(),
            policy_seed: None,
        }
    }
}

impl WorkerConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let input_queues = match lookup("RESERVATION_INPUT_QUEUES") {
            Some(raw) => {
                let queues: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if queues.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "RESERVATION_INPUT_QUEUES".into(),
                        message: "at least one queue is required".into(),
                    });
                }
                queues
            }
            None => defaults.input_queues,
        };

        let results_queue = lookup("RESERVATION_RESULTS_QUEUE")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.results_queue);

        // Present but empty disables the side channel.
        let success_notice_queue = match lookup("RESERVATION_SUCCESS_NOTICE_QUEUE") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().to_string()),
            None => defaults.success_notice_queue,
        };

        let prefetch = parse_or(
            "RESERVATION_PREFETCH",
            lookup("RESERVATION_PREFETCH"),
            defaults.prefetch,
        )?;

        let odds = AcceptanceOdds {
            regular: parse_or(
                "RESERVATION_REGULAR_ACCEPTANCE",
                lookup("RESERVATION_REGULAR_ACCEPTANCE"),
                defaults.odds.regular,
            )?,
            loyalty: parse_or(
                "RESERVATION_LOYALTY_ACCEPTANCE",
                lookup("RESERVATION_LOYALTY_ACCEPTANCE"),
                defaults.odds.loyalty,
            )?,
        };
        odds.validate()?;

        let policy_seed = match lookup("RESERVATION_POLICY_SEED") {
            Some(raw) => Some(parse_value("RESERVATION_POLICY_SEED", &raw)?),
            None => None,
        };

        Ok(Self {
            input_queues,
            results_queue,
            success_notice_queue,
            prefetch,
            odds,
            policy_seed,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
