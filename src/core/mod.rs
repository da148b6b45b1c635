//! Core gateway logic: routing, policies and load balancing.
//!
//! Everything in this module is I/O-free (the auth plugin's upstream call
//! goes through the `HttpClient` port) and operates on in-memory data, so
//! each piece is testable in isolation; the adapters wire these parts to
//! the network.

pub mod auth;
pub mod balancer;
pub mod circuit_breaker;
pub mod error;
pub mod headers;
pub mod plugin;
pub mod rate_limit;
pub mod route;
pub mod route_table;

pub use balancer::{InstanceRegistry, LoadBalancer};
pub use error::GatewayError;
pub use plugin::{GatewayContext, PluginChain};
pub use route::Route;
pub use route_table::{RouteCache, RouteTable};
