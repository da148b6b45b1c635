//! Shared scaffolding for integration tests: throwaway backends bound to
//! ephemeral ports, and a fully wired gateway handler.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{Router, body::Body, extract::Request, response::Response};
use http_body_util::BodyExt;
use hermes::{
    adapters::{GatewayHandler, HttpClientAdapter, ProxySettings, ReverseProxy},
    config::models::{GatewayConfig, RouteEntry},
    core::{
        InstanceRegistry, LoadBalancer, RouteCache,
        plugin::create_default_chain,
        route::{Route, RouteSource},
        route_table::RouteTable,
    },
    ports::http_client::HttpClient,
};
use tokio::net::TcpListener;

/// A request observed by a test backend.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub uri: String,
    pub headers: hyper::HeaderMap,
}

pub struct Backend {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
    /// Status served to clients; mutable so tests can flip behavior.
    pub status: Arc<AtomicU16>,
    /// Milliseconds to sleep before answering.
    pub delay_ms: Arc<AtomicUsize>,
}

impl Backend {
    pub fn last_seen(&self) -> SeenRequest {
        self.seen
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("backend saw no request")
    }
}

/// Spawn a backend that records every request and answers with the
/// configured status and a `method uri` echo body.
pub async fn spawn_backend(initial_status: u16) -> Backend {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let status = Arc::new(AtomicU16::new(initial_status));
    let delay_ms = Arc::new(AtomicUsize::new(0));

    let app = {
        let hits = hits.clone();
        let seen = seen.clone();
        let status = status.clone();
        let delay_ms = delay_ms.clone();
        Router::new().fallback(move |req: Request| {
            let hits = hits.clone();
            let seen = seen.clone();
            let status = status.clone();
            let delay_ms = delay_ms.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(SeenRequest {
                    method: req.method().to_string(),
                    uri: req.uri().to_string(),
                    headers: req.headers().clone(),
                });

                let delay = delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }

                let code = status.load(Ordering::SeqCst);
                Response::builder()
                    .status(code)
                    .body(Body::from(format!(
                        "{} {}",
                        req.method(),
                        req.uri()
                    )))
                    .unwrap()
            }
        })
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Backend {
        base_url: format!("http://{addr}"),
        hits,
        seen,
        status,
        delay_ms,
    }
}

pub struct TestGateway {
    pub handler: GatewayHandler,
    pub cache: Arc<RouteCache>,
    pub instances: Arc<InstanceRegistry>,
}

/// Wire a gateway handler with the given config and a pre-installed table.
pub fn build_gateway(config: &GatewayConfig, routes: Vec<Route>) -> TestGateway {
    let cache = Arc::new(RouteCache::new());
    cache.install(RouteTable::build(routes));

    let instances = Arc::new(InstanceRegistry::new());
    let balancer = Arc::new(LoadBalancer::new(
        config.load_balance_strategy,
        instances.clone(),
    ));

    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new().unwrap());
    let (chain, _breakers) = create_default_chain(config, http_client.clone(), instances.clone());

    let proxy = Arc::new(ReverseProxy::new(
        http_client,
        balancer,
        ProxySettings {
            max_retries: config.proxy_max_retries,
            stream_threshold: config.proxy_stream_threshold,
        },
    ));

    let handler = GatewayHandler::new(
        cache.clone(),
        Arc::new(chain),
        proxy,
        instances.clone(),
        Duration::from_secs(config.proxy_timeout),
    );

    TestGateway {
        handler,
        cache,
        instances,
    }
}

pub fn url_route(id: &str, pattern: &str, target_url: &str) -> Route {
    let entry = RouteEntry {
        path_pattern: pattern.to_string(),
        target_url: Some(target_url.to_string()),
        ..RouteEntry::default()
    };
    Route::from_entry(entry, id.to_string(), RouteSource::Local, 0, None).unwrap()
}

pub fn route_from_entry(id: &str, source: RouteSource, boost: i32, entry: RouteEntry) -> Route {
    Route::from_entry(entry, id.to_string(), source, boost, None).unwrap()
}

pub fn client_addr() -> SocketAddr {
    "203.0.113.10:55000".parse().unwrap()
}

pub async fn get(gateway: &TestGateway, url: &str) -> Response<Body> {
    let req = hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(url)
        .header("host", "gateway.test")
        .body(Body::empty())
        .unwrap();
    gateway.handler.handle_request(req, Some(client_addr())).await
}

pub async fn body_string(response: Response<Body>) -> String {
    let collected = response.into_body().collect().await.unwrap();
    String::from_utf8(collected.to_bytes().to_vec()).unwrap()
}
