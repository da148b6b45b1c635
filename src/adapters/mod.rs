//! Adapters binding the core to the network: the upstream HTTP client,
//! the registry client and poller, the reverse proxy and the request
//! handler.

pub mod handler;
pub mod http_client;
pub mod middleware;
pub mod proxy;
pub mod registry;
pub mod route_poller;

pub use handler::GatewayHandler;
pub use http_client::HttpClientAdapter;
pub use proxy::{ProxySettings, ReverseProxy};
pub use registry::AtlasRegistryClient;
pub use route_poller::{RoutePoller, RoutePollerSettings};
