use serde::Serialize;

/// Emitted once per request whose handler was invoked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEvent {
    pub method: String,
    pub elapsed_ms: f64,
    pub error: Option<String>,
}

pub trait EventSink: Send + Sync {
    fn processed(&self, event: ProcessedEvent);
}
