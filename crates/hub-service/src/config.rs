//! Hub configuration.
//!
//! Configuration is loaded from environment variables. Listening endpoint
//! and capacity are deployment concerns, so everything has a default.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Default listening address for the WebSocket, health and metrics endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default ceiling on concurrently registered participants.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 200;

/// Default per-connection outbound queue length.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default room actor mailbox length.
pub const DEFAULT_ROOM_MAILBOX: usize = 1024;

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listening address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum registered participants (default: 200).
    pub max_participants: usize,

    /// Outbound queue length per connection. A peer whose queue fills up
    /// during fan-out is evicted.
    pub outbound_buffer: usize,

    /// Room actor mailbox length.
    pub room_mailbox: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            room_mailbox: DEFAULT_ROOM_MAILBOX,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("HUB_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let max_participants =
            parse_positive(vars, "HUB_MAX_PARTICIPANTS", DEFAULT_MAX_PARTICIPANTS)?;
        let outbound_buffer = parse_positive(vars, "HUB_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        let room_mailbox = parse_positive(vars, "HUB_ROOM_MAILBOX", DEFAULT_ROOM_MAILBOX)?;

        Ok(Config {
            bind_address,
            max_participants,
            outbound_buffer,
            room_mailbox,
        })
    }
}

/// Parse a numeric variable that must be at least 1.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + From<u8>,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value >= T::from(1) => Ok(value),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw.clone(),
            }),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.max_participants, 200);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
        assert_eq!(config.room_mailbox, DEFAULT_ROOM_MAILBOX);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("HUB_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            ("HUB_MAX_PARTICIPANTS".to_string(), "12".to_string()),
            ("HUB_OUTBOUND_BUFFER".to_string(), "64".to_string()),
            ("HUB_ROOM_MAILBOX".to_string(), "32".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.max_participants, 12);
        assert_eq!(config.outbound_buffer, 64);
        assert_eq!(config.room_mailbox, 32);
    }

    #[test]
    fn test_from_vars_rejects_unparsable_capacity() {
        let vars = HashMap::from([("HUB_MAX_PARTICIPANTS".to_string(), "lots".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { ref name, .. }) if name == "HUB_MAX_PARTICIPANTS")
        );
    }

    #[test]
    fn test_from_vars_rejects_zero_capacity() {
        let vars = HashMap::from([("HUB_MAX_PARTICIPANTS".to_string(), "0".to_string())]);

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_from_vars_trims_whitespace() {
        let vars = HashMap::from([("HUB_OUTBOUND_BUFFER".to_string(), " 8 ".to_string())]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.outbound_buffer, 8);
    }
}
