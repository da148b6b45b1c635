//! Upstream HTTP client built on Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! The adapter keeps proxied requests untouched apart from what correct
//! forwarding requires: it derives the `Host` header from the target URI
//! and pins the outgoing version to HTTP/1.1 while ALPN may still
//! negotiate h2. Deadlines and retries are the proxy's concern, layered
//! above this port.

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    pub fn new() -> eyre::Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add a native certificate to the root store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        let host_value = match req.uri().host() {
            Some(host) => {
                let rendered = match req.uri().port() {
                    Some(port) => format!("{host}:{}", port.as_u16()),
                    None => host.to_string(),
                };
                HeaderValue::from_str(&rendered)
                    .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(HttpClientError::InvalidRequest(
                    "outgoing URI has no host".to_string(),
                ));
            }
        };
        req.headers_mut().insert(header::HOST, host_value);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        let method = outgoing.method().clone();
        let uri = outgoing.uri().clone();

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, upstream_body) = response.into_parts();
                // The body is re-framed by the server side; a stale
                // Transfer-Encoding header would corrupt it.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(upstream_body)))
            }
            Err(e) => {
                tracing::debug!(%method, %uri, error = %e, "upstream request failed");
                Err(HttpClientError::ConnectionError(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adapter_constructs() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[tokio::test]
    async fn request_without_host_is_rejected() {
        let adapter = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("/relative/only")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            adapter.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }
}
