//! Request-path error kinds and their HTTP renderings.

use axum::body::Body;
use hyper::{Response, StatusCode, header};
use thiserror::Error;

/// Errors surfaced to the client by the gateway data plane.
///
/// Rate-limit and circuit-open denials short-circuit inside the plugin
/// chain and never reach this type; everything that can fail between
/// matching and the upstream response is enumerated here.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no route matches {path}")]
    NoRoute { path: String },

    #[error("service '{service_id}' has no healthy instance")]
    NoHealthyInstance { service_id: String },

    #[error("upstream call exceeded the request deadline")]
    UpstreamTimeout,

    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),

    #[error("authentication service unavailable")]
    AuthUnavailable,

    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            Self::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            Self::AuthUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let body = match &self {
            Self::NoRoute { path } => {
                serde_json::json!({ "error": "no_route", "path": path })
            }
            Self::NoHealthyInstance { service_id } => {
                serde_json::json!({ "error": "no_healthy_instance", "service": service_id })
            }
            Self::UpstreamTimeout => serde_json::json!({ "error": "gateway_timeout" }),
            Self::UpstreamTransport(_) => serde_json::json!({ "error": "bad_gateway" }),
            Self::AuthUnavailable => serde_json::json!({ "error": "auth_unavailable" }),
            Self::Internal(_) => serde_json::json!({ "error": "internal" }),
        };
        json_response(self.status(), &body)
    }
}

/// Build a JSON response, falling back to a bare body if the builder is
/// handed an invalid header value (it never is for our inputs).
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
}
