use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors from upstream HTTP calls.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connection-level failure: refused, reset, DNS.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The upstream call exceeded its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The request could not be constructed or sent as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for making HTTP requests to upstream services.
///
/// Bodies are `axum::body::Body` on both sides so request and response
/// payloads stream through the gateway without buffering.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}
