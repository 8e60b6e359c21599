use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;
use crate::types::ValidationError;

/// Errors surfaced by the relay core and the control API.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Rejected request input; no state was changed.
    #[error("{0}")]
    Validation(String),

    /// The named queue does not exist on the broker.
    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    /// A consumer for this queue is already running.
    #[error("already consuming queue {0}")]
    AlreadyConsuming(String),

    /// No consumer is running for this queue.
    #[error("not consuming queue {0}")]
    NotConsuming(String),

    #[error("queue {0} is already paused")]
    AlreadyPaused(String),

    #[error("queue {0} is not paused")]
    NotPaused(String),

    /// No live broker link; the supervisor is recovering.
    #[error("broker unavailable")]
    BrokerUnavailable,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Store failures are fatal at the process level; this variant only
    /// exists so an in-flight request still gets a response before exit.
    #[error("config store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<ValidationError> for RelayError {
    fn from(err: ValidationError) -> Self {
        RelayError::Validation(err.0)
    }
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_)
            | RelayError::AlreadyConsuming(_)
            | RelayError::AlreadyPaused(_)
            | RelayError::NotPaused(_) => StatusCode::BAD_REQUEST,
            RelayError::QueueNotFound(_) | RelayError::NotConsuming(_) => StatusCode::NOT_FOUND,
            RelayError::BrokerUnavailable | RelayError::Broker(_) | RelayError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
