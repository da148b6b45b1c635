//! The request pipeline: reserved paths, matching, plugins, proxying.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::body::Body;
use hyper::{Request, Response, StatusCode, header};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    adapters::{middleware::RequestId, proxy::ReverseProxy},
    core::{
        balancer::InstanceRegistry,
        error::{GatewayError, json_response},
        plugin::{GatewayContext, PluginChain},
        route::RouteSource,
        route_table::RouteCache,
    },
    metrics, tracing_setup,
};

/// Paths served by the gateway itself; they take precedence over routing
/// and never enter the proxy pipeline.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

pub struct GatewayHandler {
    cache: Arc<RouteCache>,
    chain: Arc<PluginChain>,
    proxy: Arc<ReverseProxy>,
    instances: Arc<InstanceRegistry>,
    proxy_timeout: Duration,
}

impl GatewayHandler {
    pub fn new(
        cache: Arc<RouteCache>,
        chain: Arc<PluginChain>,
        proxy: Arc<ReverseProxy>,
        instances: Arc<InstanceRegistry>,
        proxy_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            chain,
            proxy,
            instances,
            proxy_timeout,
        }
    }

    /// Entry point for every inbound request.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let client_ip = client_addr.map(|addr| addr.ip());

        let span = tracing_setup::create_request_span(
            method.as_str(),
            &path,
            &request_id,
            client_ip.map(|ip| ip.to_string()).as_deref(),
        );

        let timer = metrics::RequestTimer::new(&path, method.as_str());
        let response = self
            .route_request(req, client_ip, request_id)
            .instrument(span)
            .await;
        drop(timer);

        metrics::increment_request_total(&path, method.as_str(), response.status().as_u16());
        tracing::info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            "request completed"
        );
        response
    }

    async fn route_request(
        &self,
        req: Request<Body>,
        client_ip: Option<std::net::IpAddr>,
        request_id: String,
    ) -> Response<Body> {
        match req.uri().path() {
            "/health" => return self.health_response(),
            "/metrics" => return self.metrics_response(),
            _ => {}
        }
        debug_assert!(!RESERVED_PATHS.contains(&req.uri().path()));

        let (parts, body) = req.into_parts();
        let mut ctx = GatewayContext::new(&parts, client_ip, request_id, self.proxy_timeout);

        let table = self.cache.current();
        let Some(route) = table.match_route(&ctx.method, &ctx.path) else {
            tracing::debug!(path = %ctx.path, "no route matched");
            return GatewayError::NoRoute {
                path: ctx.path.clone(),
            }
            .into_response();
        };
        tracing::debug!(route_id = %route.route_id, pattern = %route.pattern.as_str(), "route matched");
        ctx.route = Some(route);

        let before = self.chain.run_before(&mut ctx).await;
        if let Some(response) = before.response {
            return self.chain.run_after(&mut ctx, response, before.invoked).await;
        }

        let response = match self.proxy.forward(&mut ctx, body).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %ctx.path, error = %e, "forward failed");
                e.into_response()
            }
        };

        self.chain.run_after(&mut ctx, response, before.invoked).await
    }

    fn health_response(&self) -> Response<Body> {
        let table = self.cache.current();
        let body = serde_json::json!({
            "status": "ok",
            "registry_available": self.cache.registry_available(),
            "routes": {
                "total": table.len(),
                "remote": table.count_by_source(RouteSource::Remote),
                "local": table.count_by_source(RouteSource::Local),
            },
            "services": self.instances.service_count(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(StatusCode::OK, &body)
    }

    fn metrics_response(&self) -> Response<Body> {
        let table = self.cache.current();
        let body = serde_json::json!({
            "routes": table.len(),
            "healthy_instances": self.instances.healthy_instance_count(),
            "gauges": metrics::snapshot(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let mut response = json_response(StatusCode::OK, &body);
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
        response
    }
}
