//! # Route Dispatcher - Main Entry Point
//!
//! Runs the dispatcher as a standalone reverse proxy.
//!
//! ```text
//! route-dispatcher [config.yaml]
//! ```
//!
//! The config path comes from the first argument, then `DISPATCHER_CONFIG`, then
//! `config/dispatcher.yaml`. Without a config file the defaults plus environment
//! overrides are used.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use route_dispatcher::caching::{InMemoryStore, RedisStore, RedisStoreConfig, SharedStore};
use route_dispatcher::core::config::StoreConfig;
use route_dispatcher::protocols::ReqwestTransport;
use route_dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherServer, FileLoader, GatewayError, GatewayResult, MiddlewareFactory,
    RouteCollection, SharedState, StaticLoader,
};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config = load_config().await?;
    init_tracing(&config.log_filter);

    info!("Starting route dispatcher {}", env!("CARGO_PKG_VERSION"));

    let dispatcher = match build_dispatcher(&config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Failed to start dispatcher: {}", e);
            return Err(e);
        }
    };

    let listen: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid listen address '{}': {}", config.listen, e)))?;

    DispatcherServer::new(Arc::new(dispatcher), listen)
        .serve(shutdown_signal())
        .await?;

    info!("Route dispatcher shut down");
    Ok(())
}

async fn load_config() -> GatewayResult<DispatcherConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DISPATCHER_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/dispatcher.yaml"));

    if path.exists() {
        return DispatcherConfig::load_from_file(&path).await;
    }

    let mut config = DispatcherConfig::default();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .json(),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

async fn build_store(config: &StoreConfig) -> GatewayResult<SharedStore> {
    match config {
        StoreConfig::Memory { cleanup_interval } => {
            warn!("Using the in-memory store; state is not shared between processes");
            Ok(Arc::new(InMemoryStore::with_cleanup_interval(*cleanup_interval)))
        }
        StoreConfig::Redis { url } => {
            let store = RedisStore::new(RedisStoreConfig {
                url: url.clone(),
                ..Default::default()
            })
            .await?;
            Ok(Arc::new(store))
        }
    }
}

async fn build_dispatcher(config: &DispatcherConfig) -> GatewayResult<Dispatcher> {
    let store = build_store(&config.store).await?;
    let factory = MiddlewareFactory::default().with_shared(SharedState::new(store));

    let global = factory.create_many(&config.global_middlewares)?;

    let mut collection = RouteCollection::new(factory);
    if !config.routes.is_empty() {
        collection.add_loader(Arc::new(StaticLoader::new("config", config.routes.clone())));
    }
    for path in &config.route_files {
        collection.add_loader(Arc::new(FileLoader::new(path.clone())));
    }

    let transport = Arc::new(ReqwestTransport::new(config.transport.clone())?);
    let dispatcher = Dispatcher::new(collection, transport).with_global_middlewares(global);

    let routes = dispatcher.reload().await?;
    info!("Dispatcher ready with {} routes", routes);
    Ok(dispatcher)
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining in-flight requests");
}
