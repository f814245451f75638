use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::rpc::event::{EventSink, ProcessedEvent};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    response
}

/// Writes every processed JSON-RPC call to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn processed(&self, event: ProcessedEvent) {
        match event.error {
            Some(error) => warn!(
                method = %event.method,
                elapsed_ms = event.elapsed_ms,
                error = %error,
                "rpc call failed"
            ),
            None => info!(
                method = %event.method,
                elapsed_ms = event.elapsed_ms,
                "rpc call processed"
            ),
        }
    }
}
