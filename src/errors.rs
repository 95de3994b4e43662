//! Gateway error types.
//!
//! Every variant maps to one HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(GatewayError::BadPath(..))`.  Upstream status codes on plain
//! forwarding routes are relayed verbatim and never pass through here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the gateway itself.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request path had malformed percent-encoding or was not UTF-8.
    #[error("bad path: {0}")]
    BadPath(String),

    /// The request body or query was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The HTTP method is not supported on this route.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The outbound request could not be constructed.
    #[error("new request: {0}")]
    RequestBuild(String),

    /// The outbound request could not be signed.
    #[error("sign: {0}")]
    Signing(String),

    /// The object store could not be reached.
    #[error("upstream: {0}")]
    UpstreamUnavailable(String),

    /// A primitive step of a bulk operation got a non-success status.
    #[error("upstream rejected {operation} of '{key}' with status {status}")]
    UpstreamRejected {
        operation: &'static str,
        key: String,
        status: u16,
    },

    /// A listing page failed or could not be parsed.
    #[error("listing failed (status {status}): {message}")]
    ListingFailed { status: u16, message: String },

    /// A bulk operation stopped part-way; `processed` keys were already applied.
    #[error("{source}; {processed} object(s) already processed")]
    Partial {
        processed: u64,
        #[source]
        source: Box<GatewayError>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadPath(_) => StatusCode::BAD_REQUEST,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::RequestBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamRejected { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ListingFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Partial { source, .. } => source.status_code(),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            [
                ("content-type", "text/plain; charset=utf-8".to_string()),
                ("x-request-id", generate_request_id()),
                ("access-control-allow-origin", "*".to_string()),
            ],
            format!("{self}\n"),
        )
            .into_response()
    }
}
