use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    middleware,
    response::Response,
    routing::any,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use hermes::{
    adapters::{
        AtlasRegistryClient, GatewayHandler, HttpClientAdapter, ProxySettings, ReverseProxy,
        RoutePoller, RoutePollerSettings, middleware::request_id_middleware,
    },
    config::{
        GatewayConfigValidator,
        loader::{build_local_routes, load_gateway_config, load_routes_file},
    },
    core::{
        InstanceRegistry, LoadBalancer, RouteCache, plugin::create_default_chain,
    },
    metrics,
    ports::{http_client::HttpClient, registry::RegistryProvider},
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration and the local route file
    Validate,
    /// Start the gateway (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate) => validate_command(),
        Some(Commands::Serve) | None => serve_command().await,
    }
}

fn validate_command() -> Result<()> {
    let config = load_gateway_config()?;
    println!("Configuration parsing: OK");

    let routes_file = load_routes_file(&config.local_routes_file)?;
    println!(
        "Route file parsing: OK ({} entries)",
        routes_file.routes.len()
    );

    match GatewayConfigValidator::validate(&config, &routes_file) {
        Ok(()) => {
            println!("Validation: OK");
            println!("  listen: {}", config.listen_addr());
            println!(
                "  registry: {} ({})",
                config.registry_url,
                if config.registry_enabled { "enabled" } else { "disabled" }
            );
            println!("  local routes: {}", routes_file.routes.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn serve_command() -> Result<()> {
    let config = load_gateway_config().context("Failed to load configuration")?;

    tracing_setup::init_tracing(&config.log_level, config.log_json)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    metrics::init_metrics();

    let routes_file = load_routes_file(&config.local_routes_file)
        .context("Failed to load local route file")?;
    GatewayConfigValidator::validate(&config, &routes_file)
        .map_err(|e| eyre!("Configuration invalid: {e}"))?;

    let local_routes = build_local_routes(&routes_file, config.local_routes_priority_boost);
    tracing::info!(
        listen = %config.listen_addr(),
        local_routes = local_routes.len(),
        registry_enabled = config.registry_enabled,
        "starting hermes"
    );

    // Shared state: route cache, instance registry, balancer.
    let cache = Arc::new(RouteCache::new());
    let instances = Arc::new(InstanceRegistry::new());
    let balancer = Arc::new(LoadBalancer::new(
        config.load_balance_strategy,
        instances.clone(),
    ));

    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new().context("Failed to create upstream HTTP client")?,
    );

    let (chain, _breakers) = create_default_chain(&config, http_client.clone(), instances.clone());
    let chain = Arc::new(chain);
    tracing::info!(
        plugins = ?chain.plugins().iter().map(|p| p.name()).collect::<Vec<_>>(),
        "plugin chain composed"
    );

    let proxy = Arc::new(ReverseProxy::new(
        http_client.clone(),
        balancer.clone(),
        ProxySettings {
            max_retries: config.proxy_max_retries,
            stream_threshold: config.proxy_stream_threshold,
        },
    ));

    let registry: Option<Arc<dyn RegistryProvider>> = if config.registry_enabled {
        Some(Arc::new(AtlasRegistryClient::new(
            &config.registry_url,
            &config.gateway_id,
            Duration::from_secs(config.registry_timeout),
        )))
    } else {
        None
    };

    let poller = Arc::new(RoutePoller::new(
        registry,
        cache.clone(),
        instances.clone(),
        local_routes,
        RoutePollerSettings {
            poll_interval: Duration::from_secs(config.registry_poll_interval),
            bootstrap_timeout: Duration::from_secs(config.registry_bootstrap_timeout),
            fallback_to_local: config.fallback_to_local,
        },
    ));

    // First refresh blocks startup up to its bounded timeout.
    poller.bootstrap().await;
    let poller_task = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run().await })
    };

    let handler = Arc::new(GatewayHandler::new(
        cache,
        chain,
        proxy,
        instances,
        Duration::from_secs(config.proxy_timeout),
    ));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!(error = %e, "signal handler error");
            }
        });
    }

    let make_route = |handler: Arc<GatewayHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    Ok::<Response<Body>, std::convert::Infallible>(
                        handler.handle_request(req, Some(client_addr)).await,
                    )
                }
            },
        )
    };

    let app = Router::new()
        .route("/", make_route(handler.clone()))
        .route("/{*path}", make_route(handler.clone()))
        .layer(middleware::from_fn(request_id_middleware));

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(%addr, "hermes listening");

    let result = tokio::select! {
        served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => served.context("Server error"),
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!(?reason, "shutting down");
            Ok(())
        }
    };

    poller_task.abort();
    tracing::info!("hermes stopped");
    result
}
