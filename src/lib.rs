//! Hermes - a lightweight API gateway.
//!
//! Hermes is the single ingress for a microservice fleet: it terminates
//! client HTTP traffic, matches each request against a route table merged
//! from a service registry (ServiceAtlas) and a local YAML file, applies an
//! ordered policy chain (authentication, rate limiting, circuit breaking,
//! header rewriting), picks an upstream instance through a configurable
//! load balancing strategy and reverse-proxies the request.
//!
//! # Features
//! - Registry-driven routing with local-file merge and priority boost;
//!   fully functional when the registry is down
//! - Glob route patterns (`*` one segment, trailing `**` any suffix) with
//!   deterministic priority / source / id tie-breaking
//! - Round-robin, random and least-connections balancing over the healthy
//!   instance set
//! - Token-bucket rate limiting at global, per-route and per-IP scope with
//!   an LRU-bounded IP map
//! - Per-target circuit breaker with single-probe half-open recovery
//! - Streaming reverse proxy with budgeted retries and hop-by-hop hygiene
//! - Structured tracing, metrics and graceful shutdown
//!
//! # Architecture
//! Business logic lives in [`core`] and is I/O-free; [`ports`] declare the
//! traits the core consumes and [`adapters`] implement them over Hyper,
//! reqwest and Axum. The binary crate wires everything together.
//!
//! # Error Handling
//! Application-level fallible APIs return `eyre::Result`; request-path
//! failures are the closed [`core::error::GatewayError`] set, each with a
//! fixed HTTP rendering.

pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{AtlasRegistryClient, GatewayHandler, HttpClientAdapter, ReverseProxy, RoutePoller},
    config::GatewayConfig,
    core::{GatewayError, InstanceRegistry, LoadBalancer, PluginChain, RouteCache},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
