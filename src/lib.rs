use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod config;
pub mod discovery;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod rpc;
pub mod server;

use rpc::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", post(http::handlers::rpc_endpoint))
        .route("/health", get(http::handlers::health))
        .route("/services", get(http::handlers::services))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
