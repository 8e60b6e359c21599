use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

use crate::types::DEFAULT_TIMEZONE;

const DEFAULT_DB_PATH: &str = "/data/consumers.db";
const DEFAULT_API_PORT: u16 = 3000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Process configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// AMQP URL of the broker (`RABBITMQ_URL`, required).
    pub rabbitmq_url: String,

    /// URL notified when a queue drains or a consumer is stopped
    /// (`FINISH_WEBHOOK`, required).
    pub finish_webhook: String,

    /// Path of the embedded config store (`DB_PATH`).
    pub db_path: PathBuf,

    /// Control API listen port (`API_PORT`).
    pub api_port: u16,

    /// Full-reconnect budget before the process exits for a clean restart
    /// (`MAX_RECONNECT_ATTEMPTS`).
    pub max_reconnect_attempts: u32,

    /// Timezone of the business-hours gate (`RELAY_TIMEZONE`).
    pub timezone: Tz,

    /// Optional HMAC secret for outbound request signatures (`WEBHOOK_SECRET`).
    pub webhook_secret: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

impl RelayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rabbitmq_url = require_var("RABBITMQ_URL")?;
        let finish_webhook = require_var("FINISH_WEBHOOK")?;

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        let api_port = parse_var("API_PORT", DEFAULT_API_PORT)?;
        let max_reconnect_attempts =
            parse_var("MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS)?;

        let timezone = match std::env::var("RELAY_TIMEZONE") {
            Ok(value) => value.parse::<Tz>().map_err(|_| ConfigError::Invalid {
                var: "RELAY_TIMEZONE",
                value,
            })?,
            Err(_) => DEFAULT_TIMEZONE
                .parse::<Tz>()
                .expect("default timezone is a valid IANA name"),
        };

        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);

        Ok(Self {
            rabbitmq_url,
            finish_webhook,
            db_path,
            api_port,
            max_reconnect_attempts,
            timezone,
            webhook_secret,
        })
    }
}

fn require_var(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timezone_parses() {
        let tz: Tz = DEFAULT_TIMEZONE.parse().expect("valid timezone");
        assert_eq!(tz.name(), "America/Sao_Paulo");
    }
}
