use std::sync::Arc;

use micro_jsonrpc::{
    build_app,
    config::Config,
    discovery::watcher::{WatchOptions, Watcher},
    domain::catalog::Catalog,
    logging::{self, TracingSink},
    rpc::{dispatcher::Dispatcher, registry::MethodRegistry},
    server::RpcServer,
    AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let catalog = Arc::new(Catalog::new());

    let registry = MethodRegistry::builder().register(catalog.clone()).build();
    let methods = registry.methods();
    info!(count = methods.len(), methods = ?methods, "json-rpc methods registered");
    let dispatcher =
        Arc::new(Dispatcher::new(registry).with_event_sink(Arc::new(TracingSink)));

    let watcher = match config.discovery_endpoint.as_deref() {
        Some(endpoint) => {
            let options = WatchOptions {
                connect_timeout: config.connect_timeout,
                ..WatchOptions::default()
            };
            let watcher = Arc::new(Watcher::new(
                endpoint,
                config.discovery_prefix.as_bytes(),
                catalog.clone(),
                options,
            )?);
            watcher.forever();
            Some(watcher)
        }
        None => {
            warn!("DISCOVERY_ENDPOINT not set, discovery watch disabled");
            None
        }
    };

    let tcp = Arc::new(RpcServer::bind(&config, dispatcher.clone()).await?);
    let http_listener = tokio::net::TcpListener::bind(config.http_socket()?).await?;
    let app = build_app(AppState::new(dispatcher));

    info!(
        host = %config.host,
        port = config.port,
        http_port = config.http_port,
        reuse_port = config.reuse_port,
        "server starting"
    );

    let shutdown = tcp.shutdown_handle();
    let http_shutdown = shutdown.clone();
    let tcp_task = {
        let tcp = Arc::clone(&tcp);
        tokio::spawn(async move { tcp.serve().await })
    };
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app.into_make_service())
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    tcp.shutdown();
    if let Some(watcher) = watcher {
        watcher.close().await;
    }

    tcp_task.await??;
    http_task.await??;
    Ok(())
}
