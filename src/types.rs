use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default randomized delay bounds applied when a consume request omits them.
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 110_000;

/// Default forwarding window, local hours.
pub const DEFAULT_BUSINESS_HOURS: BusinessHours = BusinessHours { start: 8, end: 21 };

/// Default IANA timezone for the business-hours gate.
pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";

/// Durable definition of one queue consumer.
///
/// A `ConsumerSpec` describes *what* to consume and *where* to forward it.
/// It is a pure configuration object with no broker state; the runtime
/// counterpart lives in the registry.
///
/// Specs are unique by `queue` and survive restarts through the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSpec {
    /// Source AMQP queue, non-empty after trimming.
    pub queue: String,

    /// Target webhook, absolute http/https URL.
    pub webhook: String,

    /// Lower bound of the randomized inter-message delay.
    pub min_interval_ms: u64,

    /// Upper bound of the randomized inter-message delay, `>= min`.
    pub max_interval_ms: u64,

    /// First local hour (inclusive) of the forwarding window.
    pub business_hours_start: u8,

    /// Last local hour (exclusive) of the forwarding window.
    pub business_hours_end: u8,

    /// Whether deliveries are currently requeued instead of forwarded.
    pub paused: bool,

    /// Maintained by the store; `None` until persisted.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConsumerSpec {
    /// Validate raw inputs and assemble a spec with `paused = false`.
    pub fn build(
        queue: &str,
        webhook: &str,
        min_interval_ms: u64,
        max_interval_ms: u64,
        hours: BusinessHours,
    ) -> Result<Self, ValidationError> {
        let queue = validate_queue_name(queue)?;
        let webhook = validate_webhook_url(webhook)?;
        validate_intervals(min_interval_ms, max_interval_ms)?;
        validate_business_hours(&hours)?;

        Ok(Self {
            queue,
            webhook,
            min_interval_ms,
            max_interval_ms,
            business_hours_start: hours.start,
            business_hours_end: hours.end,
            paused: false,
            created_at: None,
            updated_at: None,
        })
    }

    /// Mean delay in seconds, used for completion estimates.
    pub fn avg_interval_seconds(&self) -> f64 {
        (self.min_interval_ms + self.max_interval_ms) as f64 / 2_000.0
    }
}

/// Daily forwarding window `[start, end)` in local hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start: u8,
    pub end: u8,
}

/// Rejected input from the control API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Trim and check a queue name. Returns the trimmed form.
pub fn validate_queue_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError("queue must be a non-empty string".into()));
    }
    Ok(trimmed.to_string())
}

/// Check that a webhook target is an absolute http/https URL.
pub fn validate_webhook_url(raw: &str) -> Result<String, ValidationError> {
    if !raw.starts_with("http") {
        return Err(ValidationError(
            "webhook must be an absolute http(s) URL".into(),
        ));
    }
    Ok(raw.to_string())
}

pub fn validate_intervals(min_ms: u64, max_ms: u64) -> Result<(), ValidationError> {
    if min_ms > max_ms {
        return Err(ValidationError(format!(
            "minInterval ({min_ms}) must not exceed maxInterval ({max_ms})"
        )));
    }
    Ok(())
}

pub fn validate_business_hours(hours: &BusinessHours) -> Result<(), ValidationError> {
    if hours.start > 24 || hours.end > 24 {
        return Err(ValidationError(
            "businessHours.start and businessHours.end must be within [0, 24]".into(),
        ));
    }
    if hours.start > hours.end {
        return Err(ValidationError(format!(
            "businessHours.start ({}) must not exceed businessHours.end ({})",
            hours.start, hours.end
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours(start: u8, end: u8) -> BusinessHours {
        BusinessHours { start, end }
    }

    #[test]
    fn build_accepts_valid_input() {
        let spec =
            ConsumerSpec::build("orders", "https://example.com/hook", 1_000, 2_000, hours(8, 21))
                .expect("valid spec");
        assert_eq!(spec.queue, "orders");
        assert!(!spec.paused);
        assert!(spec.created_at.is_none());
    }

    #[test]
    fn queue_name_is_trimmed() {
        let spec =
            ConsumerSpec::build("  orders  ", "http://w", 0, 0, hours(0, 24)).expect("valid spec");
        assert_eq!(spec.queue, "orders");
    }

    #[test]
    fn empty_queue_is_rejected() {
        assert!(validate_queue_name("   ").is_err());
        assert!(validate_queue_name("").is_err());
    }

    #[test]
    fn webhook_must_be_http() {
        assert!(validate_webhook_url("ftp://example.com").is_err());
        assert!(validate_webhook_url("https://example.com").is_ok());
        assert!(validate_webhook_url("http://example.com").is_ok());
    }

    #[test]
    fn min_must_not_exceed_max() {
        assert!(validate_intervals(5_000, 1_000).is_err());
        assert!(validate_intervals(1_000, 1_000).is_ok());
        assert!(validate_intervals(0, 0).is_ok());
    }

    #[test]
    fn business_hours_bounds() {
        assert!(validate_business_hours(&hours(0, 24)).is_ok());
        assert!(validate_business_hours(&hours(8, 8)).is_ok());
        assert!(validate_business_hours(&hours(9, 8)).is_err());
        assert!(validate_business_hours(&hours(0, 25)).is_err());
    }

    #[test]
    fn avg_interval_is_mean_of_bounds() {
        let spec =
            ConsumerSpec::build("q", "http://w", 30_000, 110_000, hours(8, 21)).expect("valid");
        assert_eq!(spec.avg_interval_seconds(), 70.0);
    }

    #[test]
    fn spec_serializes_camel_case() {
        let spec = ConsumerSpec::build("q", "http://w", 1, 2, hours(8, 21)).expect("valid");
        let value = serde_json::to_value(&spec).expect("serialize");
        assert!(value.get("minIntervalMs").is_some());
        assert!(value.get("businessHoursStart").is_some());
    }
}
