//! The reverse proxy: forwards a matched request to its upstream target.
//!
//! One wall-clock deadline covers the whole forward, retries included; each
//! attempt spends whatever budget remains. Transport failures and
//! 502/503/504 responses are retried with a fresh balancer pick, but only
//! when the request body was small enough to buffer for replay and the
//! method is idempotent (or the route opted in). Larger or unsized bodies
//! stream straight through and get exactly one attempt.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use tokio::time::timeout;

use crate::{
    core::{
        balancer::{LoadBalancer, PickedInstance},
        error::GatewayError,
        plugin::GatewayContext,
        route::{Route, RouteTarget},
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    pub max_retries: u32,
    /// Bodies with a known length at or below this are buffered for replay.
    pub stream_threshold: u64,
}

pub struct ReverseProxy {
    http_client: Arc<dyn HttpClient>,
    balancer: Arc<LoadBalancer>,
    settings: ProxySettings,
}

/// Response body wrapper that pins the balancer's connection guard to the
/// body's lifetime, so `active_conn_count` drops only once the response
/// has fully streamed (or the client went away).
struct GuardedBody {
    inner: Body,
    _picked: Option<PickedInstance>,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl ReverseProxy {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        balancer: Arc<LoadBalancer>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            http_client,
            balancer,
            settings,
        }
    }

    pub async fn forward(
        &self,
        ctx: &mut GatewayContext,
        body: Body,
    ) -> Result<Response<Body>, GatewayError> {
        let route = ctx
            .route
            .clone()
            .ok_or_else(|| GatewayError::Internal("forward without a matched route".into()))?;

        let buffered = self.buffer_if_replayable(ctx, body).await?;
        let (mut streamed, buffered) = match buffered {
            BodyMode::Buffered(bytes) => (None, Some(bytes)),
            BodyMode::Streamed(body) => (Some(body), None),
        };

        let can_retry = buffered.is_some() && method_retryable(&ctx.method, &route);
        let max_attempts = if can_retry {
            self.settings.max_retries.saturating_add(1)
        } else {
            1
        };

        let upstream_path = route.upstream_path(&ctx.path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let (base_url, picked) = self.pick_target(&route)?;
            let uri = build_upstream_uri(&base_url, &upstream_path, ctx.query.as_deref());

            let attempt_body = match (&buffered, streamed.take()) {
                (Some(bytes), _) => Body::from(bytes.clone()),
                (None, Some(body)) => body,
                (None, None) => {
                    return Err(GatewayError::Internal(
                        "streamed request body already consumed".into(),
                    ));
                }
            };

            let request = build_upstream_request(ctx, &uri, attempt_body)?;

            let remaining = ctx
                .deadline
                .checked_duration_since(Instant::now())
                .ok_or(GatewayError::UpstreamTimeout)?;

            ctx.forward_attempted = true;
            let started = Instant::now();
            let outcome = timeout(remaining, self.http_client.send_request(request)).await;

            match outcome {
                // Deadline hit: the in-flight call is dropped (cancelled)
                // and no further attempt may start.
                Err(_) => {
                    tracing::warn!(%uri, attempt, "upstream call exceeded request deadline");
                    return Err(GatewayError::UpstreamTimeout);
                }
                Ok(Err(e)) => {
                    metrics::record_upstream_request(&base_url, 502, started.elapsed());
                    if attempt < max_attempts {
                        tracing::warn!(%uri, attempt, error = %e, "transport failure, retrying");
                        drop(picked);
                        continue;
                    }
                    return Err(match e {
                        HttpClientError::Timeout(d) => {
                            tracing::warn!(%uri, ?d, "upstream timed out");
                            GatewayError::UpstreamTimeout
                        }
                        other => GatewayError::UpstreamTransport(other.to_string()),
                    });
                }
                Ok(Ok(response)) => {
                    let status = response.status();
                    metrics::record_upstream_request(&base_url, status.as_u16(), started.elapsed());

                    if retryable_status(status) && attempt < max_attempts {
                        tracing::warn!(%uri, attempt, %status, "retryable upstream status");
                        drop(picked);
                        continue;
                    }

                    let (parts, upstream_body) = response.into_parts();
                    let guarded = GuardedBody {
                        inner: upstream_body,
                        _picked: picked,
                    };
                    return Ok(Response::from_parts(parts, Body::new(guarded)));
                }
            }
        }
    }

    fn pick_target(
        &self,
        route: &Route,
    ) -> Result<(String, Option<PickedInstance>), GatewayError> {
        match &route.target {
            RouteTarget::DirectUrl(url) => Ok((url.clone(), None)),
            RouteTarget::Service(service_id) => {
                let picked = self.balancer.pick(service_id)?;
                Ok((picked.base_url.clone(), Some(picked)))
            }
        }
    }

    /// Buffer the request body when its size is known and small enough to
    /// replay across retries; otherwise keep it streaming.
    async fn buffer_if_replayable(
        &self,
        ctx: &GatewayContext,
        body: Body,
    ) -> Result<BodyMode, GatewayError> {
        let content_length = ctx
            .headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let bodyless_method =
            ctx.method == Method::GET || ctx.method == Method::HEAD || ctx.method == Method::OPTIONS;

        match content_length {
            Some(0) => Ok(BodyMode::Buffered(Bytes::new())),
            Some(n) if n <= self.settings.stream_threshold => {
                let collected = body
                    .collect()
                    .await
                    .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;
                Ok(BodyMode::Buffered(collected.to_bytes()))
            }
            None if bodyless_method => Ok(BodyMode::Buffered(Bytes::new())),
            _ => Ok(BodyMode::Streamed(body)),
        }
    }
}

enum BodyMode {
    Buffered(Bytes),
    Streamed(Body),
}

fn method_retryable(method: &Method, route: &Route) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::TRACE
        || route.retry_non_idempotent
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

fn build_upstream_uri(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match query {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    }
}

fn build_upstream_request(
    ctx: &GatewayContext,
    uri: &str,
    body: Body,
) -> Result<Request<Body>, GatewayError> {
    let mut request = Request::builder()
        .method(ctx.method.clone())
        .uri(uri)
        .body(body)
        .map_err(|e| GatewayError::Internal(format!("building upstream request: {e}")))?;
    *request.headers_mut() = ctx.forward_headers.clone();
    Ok(request)
}
