use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::RelayError;
use crate::relay::{self, RelayContext};
use crate::types::{
    BusinessHours, ConsumerSpec, DEFAULT_BUSINESS_HOURS, DEFAULT_MAX_INTERVAL_MS,
    DEFAULT_MIN_INTERVAL_MS,
};

/// Assemble the control-plane router.
///
/// Handlers stay thin: validate the body, call into the relay core, render
/// the result. All error mapping lives on [`RelayError`].
pub fn router(ctx: Arc<RelayContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/consume", post(consume))
        .route("/active-queues", get(active_queues))
        .route("/queue-info/:queue", get(queue_info))
        .route("/queues-info", post(queues_info))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// GET /health: 200 only while both connection and channel are live.
async fn health(State(ctx): State<Arc<RelayContext>>) -> impl IntoResponse {
    let healthy = match ctx.link.read().await.as_ref() {
        Some(link) => link.is_healthy(),
        None => false,
    };

    if healthy {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }
}

/// POST /consume: persist a spec and start consuming.
async fn consume(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, RelayError> {
    let spec = parse_consume_request(&body)?;
    let queue = spec.queue.clone();

    relay::start_consumer(&ctx, spec)
        .await
        .map_err(|err| match err {
            // On this endpoint a missing queue is a caller mistake, not a
            // missing resource.
            RelayError::QueueNotFound(queue) => {
                RelayError::Validation(format!("queue {queue} does not exist"))
            }
            other => other,
        })?;

    Ok(Json(json!({ "queue": queue, "status": "consuming" })))
}

/// GET /active-queues: registry snapshot with completion estimates.
async fn active_queues(
    State(ctx): State<Arc<RelayContext>>,
) -> Result<impl IntoResponse, RelayError> {
    let rows = relay::active_queues(&ctx).await?;
    Ok(Json(rows))
}

/// GET /queue-info/:queue: broker counters for one queue.
async fn queue_info(
    State(ctx): State<Arc<RelayContext>>,
    Path(queue): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let info = relay::queue_info(&ctx, &queue).await?;
    Ok(Json(info))
}

/// POST /queues-info: bulk variant; failures are reported per element.
async fn queues_info(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, RelayError> {
    let queues = body
        .get("queues")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::Validation("queues must be an array".into()))?;

    let mut rows = Vec::with_capacity(queues.len());
    for entry in queues {
        let Some(queue) = entry.as_str() else {
            rows.push(json!({ "queue": entry, "error": "queue must be a string" }));
            continue;
        };

        match relay::queue_info(&ctx, queue).await {
            Ok(info) => rows.push(serde_json::to_value(info).unwrap_or_default()),
            Err(err) => rows.push(json!({ "queue": queue, "error": err.to_string() })),
        }
    }

    Ok(Json(Value::Array(rows)))
}

/// POST /pause: requeue deliveries instead of forwarding them.
async fn pause(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, RelayError> {
    let queue = body_queue(&body)?;
    relay::pause(&ctx, &queue).await?;
    Ok(Json(json!({ "queue": queue, "status": "paused" })))
}

/// POST /resume: lift a pause.
async fn resume(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, RelayError> {
    let queue = body_queue(&body)?;
    relay::resume(&ctx, &queue).await?;
    Ok(Json(json!({ "queue": queue, "status": "consuming" })))
}

/// POST /stop: cancel, notify finish, forget the queue.
async fn stop(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, RelayError> {
    let queue = body_queue(&body)?;
    relay::stop(&ctx, &queue).await?;
    Ok(Json(json!({ "queue": queue, "status": "stopped" })))
}

fn body_queue(body: &Value) -> Result<String, RelayError> {
    let raw = required_str(body, "queue")?;
    crate::types::validate_queue_name(&raw).map_err(Into::into)
}

fn parse_consume_request(body: &Value) -> Result<ConsumerSpec, RelayError> {
    let queue = required_str(body, "queue")?;
    let webhook = required_str(body, "webhook")?;
    let min_interval = optional_u64(body, "minInterval", DEFAULT_MIN_INTERVAL_MS)?;
    let max_interval = optional_u64(body, "maxInterval", DEFAULT_MAX_INTERVAL_MS)?;
    let hours = match body.get("businessHours") {
        Some(raw) if !raw.is_null() => parse_business_hours(raw)?,
        _ => DEFAULT_BUSINESS_HOURS,
    };

    ConsumerSpec::build(&queue, &webhook, min_interval, max_interval, hours).map_err(Into::into)
}

fn required_str(body: &Value, key: &str) -> Result<String, RelayError> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::Validation(format!("{key} must be a string")))
}

fn optional_u64(body: &Value, key: &str, default: u64) -> Result<u64, RelayError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            RelayError::Validation(format!("{key} must be a non-negative integer"))
        }),
    }
}

fn parse_business_hours(raw: &Value) -> Result<BusinessHours, RelayError> {
    Ok(BusinessHours {
        start: hour_field(raw, "start")?,
        end: hour_field(raw, "end")?,
    })
}

fn hour_field(raw: &Value, key: &str) -> Result<u8, RelayError> {
    raw.get(key)
        .and_then(Value::as_u64)
        .filter(|value| *value <= 24)
        .map(|value| value as u8)
        .ok_or_else(|| {
            RelayError::Validation(format!(
                "businessHours.{key} must be an integer within [0, 24]"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_request_applies_defaults() {
        let body = json!({ "queue": "q1", "webhook": "http://example.com" });
        let spec = parse_consume_request(&body).expect("valid");
        assert_eq!(spec.min_interval_ms, DEFAULT_MIN_INTERVAL_MS);
        assert_eq!(spec.max_interval_ms, DEFAULT_MAX_INTERVAL_MS);
        assert_eq!(spec.business_hours_start, 8);
        assert_eq!(spec.business_hours_end, 21);
    }

    #[test]
    fn consume_request_rejects_missing_fields() {
        assert!(parse_consume_request(&json!({ "webhook": "http://w" })).is_err());
        assert!(parse_consume_request(&json!({ "queue": "q" })).is_err());
        assert!(parse_consume_request(&json!({ "queue": 3, "webhook": "http://w" })).is_err());
    }

    #[test]
    fn consume_request_rejects_negative_intervals() {
        let body = json!({ "queue": "q", "webhook": "http://w", "minInterval": -5 });
        assert!(parse_consume_request(&body).is_err());
    }

    #[test]
    fn consume_request_rejects_inverted_intervals() {
        let body =
            json!({ "queue": "q", "webhook": "http://w", "minInterval": 10, "maxInterval": 5 });
        assert!(parse_consume_request(&body).is_err());
    }

    #[test]
    fn consume_request_rejects_out_of_range_hours() {
        let body = json!({
            "queue": "q",
            "webhook": "http://w",
            "businessHours": { "start": 8, "end": 25 }
        });
        assert!(parse_consume_request(&body).is_err());

        let body = json!({
            "queue": "q",
            "webhook": "http://w",
            "businessHours": { "start": -1, "end": 20 }
        });
        assert!(parse_consume_request(&body).is_err());
    }

    #[test]
    fn consume_request_accepts_explicit_hours() {
        let body = json!({
            "queue": "q",
            "webhook": "http://w",
            "businessHours": { "start": 0, "end": 24 }
        });
        let spec = parse_consume_request(&body).expect("valid");
        assert_eq!(spec.business_hours_start, 0);
        assert_eq!(spec.business_hours_end, 24);
    }
}
