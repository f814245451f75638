//! Request dispatch
//!
//! Parses payloads, validates each request, runs every matched handler as its own task and
//! assembles the correlated responses once all of them have completed.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::rpc::{
    barrier::CompletionBarrier,
    event::{EventSink, ProcessedEvent},
    message::{self, Request, Response, RpcError, JSONRPC_VERSION},
    registry::{MethodRegistry, ServiceError},
};

pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn services(&self) -> Vec<String> {
        self.registry.services()
    }

    /// Full pipeline for one payload: parse, dispatch, assemble, encode.
    ///
    /// The returned bytes carry no frame delimiter.
    pub async fn handle(&self, content: &[u8]) -> Vec<u8> {
        let (single, requests) = match message::parse(content) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "rejecting unparseable payload");
                let response = Response::error(RpcError::parse_error(), None);
                return message::encode(true, &[response]);
            }
        };

        if requests.is_empty() {
            let response = Response::error(RpcError::invalid_request(), None);
            return message::encode(true, &[response]);
        }

        let responses = self.process(requests).await;
        message::encode(single, &responses)
    }

    /// Runs every request concurrently and returns one response per request, in completion
    /// order.
    pub async fn process(&self, requests: Vec<Request>) -> Vec<Response> {
        let barrier = CompletionBarrier::new(requests.len());
        let responses = Arc::new(Mutex::new(Vec::with_capacity(requests.len())));

        for request in requests {
            let guard = barrier.guard();
            let responses = Arc::clone(&responses);
            let registry = Arc::clone(&self.registry);
            let sink = self.sink.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let response = execute(&registry, sink.as_deref(), request).await;
                responses.lock().await.push(response);
            });
        }

        barrier.wait().await;
        let mut responses = responses.lock().await;
        std::mem::take(&mut *responses)
    }
}

pub fn validate(request: &Request) -> Result<(), RpcError> {
    let version_ok = request.jsonrpc.as_str() == Some(JSONRPC_VERSION);
    let method_ok = request
        .method
        .as_str()
        .is_some_and(|method| !method.is_empty());
    let id_ok = matches!(
        request.id,
        None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_))
    );

    if version_ok && method_ok && id_ok {
        Ok(())
    } else {
        Err(RpcError::invalid_request())
    }
}

async fn execute(
    registry: &MethodRegistry,
    sink: Option<&dyn EventSink>,
    request: Request,
) -> Response {
    let id = request.id.clone();

    if let Err(error) = validate(&request) {
        return Response::error(error, id);
    }

    let method = request.method_name().unwrap_or_default().to_string();
    let Some(handler) = registry.get(&method) else {
        return Response::error(RpcError::method_not_found(), id);
    };

    let started_at = Instant::now();
    let outcome = AssertUnwindSafe(handler.invoke(request.positional_params()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ServiceError::new(panic_message(panic.as_ref()))));
    let elapsed_ms = (started_at.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;

    let (response, error) = match outcome {
        Ok(result) => (Response::result(wrap_scalar(result), id), None),
        Err(err) => {
            let code = err.code.unwrap_or(0);
            let error = format!("[{code}] {}", err.message);
            (Response::error(RpcError::new(code, err.message), id), Some(error))
        }
    };

    if let Some(sink) = sink {
        sink.processed(ProcessedEvent {
            method,
            elapsed_ms,
            error,
        });
    }

    response
}

fn wrap_scalar(result: Value) -> Value {
    match result {
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Value::Array(vec![result]),
        other => other,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::rpc::{message::Outcome, registry::Service};

    struct Calc;

    #[async_trait]
    impl Service for Calc {
        fn name(&self) -> &str {
            "Calc"
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["Add", "Slow", "Fail", "Boom", "Echo"]
        }

        async fn call(&self, operation: &str, params: Vec<Value>) -> Result<Value, ServiceError> {
            match operation {
                "Add" => Ok(json!(params.iter().filter_map(Value::as_i64).sum::<i64>())),
                "Slow" => {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Ok(json!("slow"))
                }
                "Fail" => Err(ServiceError::with_code(1001, "insufficient funds")),
                "Boom" => panic!("exploded"),
                _ => Ok(json!({ "params": params })),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<ProcessedEvent>>,
    }

    impl EventSink for RecordingSink {
        fn processed(&self, event: ProcessedEvent) {
            self.events.lock().expect("sink lock").push(event);
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(MethodRegistry::builder().register(Arc::new(Calc)).build())
    }

    async fn call(dispatcher: &Dispatcher, payload: &str) -> Value {
        let body = dispatcher.handle(payload.as_bytes()).await;
        serde_json::from_slice(&body).expect("json response")
    }

    fn by_id(responses: &Value, id: Value) -> &Value {
        responses
            .as_array()
            .expect("batch response")
            .iter()
            .find(|response| response["id"] == id)
            .expect("response for id")
    }

    #[tokio::test]
    async fn single_request_yields_single_result() {
        let response = call(
            &dispatcher(),
            r#"{"jsonrpc":"2.0","method":"Calc.Add","params":[1,2],"id":1}"#,
        )
        .await;

        assert_eq!(response, json!({"jsonrpc":"2.0","id":1,"result":[3]}));
    }

    #[tokio::test]
    async fn batch_correlates_every_request_by_id() {
        let response = call(
            &dispatcher(),
            r#"[
                {"jsonrpc":"2.0","method":"Calc.Add","params":[2,2],"id":1},
                {"jsonrpc":"1.0","method":"Calc.Add","params":[],"id":2},
                {"jsonrpc":"2.0","method":"Calc.Missing","id":"three"},
                {"jsonrpc":"2.0","method":"","id":4},
                {"jsonrpc":"2.0","method":"Calc.Echo","params":[true],"id":5}
            ]"#,
        )
        .await;

        assert_eq!(response.as_array().map(Vec::len), Some(5));
        assert_eq!(by_id(&response, json!(1))["result"], json!([4]));
        assert_eq!(by_id(&response, json!(2))["error"]["code"], -32600);
        assert_eq!(by_id(&response, json!("three"))["error"]["code"], -32601);
        assert_eq!(by_id(&response, json!(4))["error"]["code"], -32600);
        assert_eq!(
            by_id(&response, json!(5))["result"],
            json!({"params": [true]})
        );
    }

    #[tokio::test]
    async fn malformed_payload_yields_one_parse_error() {
        let response = call(&dispatcher(), r#"[{"jsonrpc":"2.0","method":"Calc.Add""#).await;

        assert_eq!(
            response,
            json!({"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}})
        );
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let response = call(&dispatcher(), "[]").await;
        assert_eq!(response["error"]["code"], -32600);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn non_scalar_id_is_invalid() {
        let response = call(
            &dispatcher(),
            r#"{"jsonrpc":"2.0","method":"Calc.Add","id":{"nested":1}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn notifications_still_receive_a_response() {
        let response = call(
            &dispatcher(),
            r#"{"jsonrpc":"2.0","method":"Calc.Add","params":[5]}"#,
        )
        .await;

        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["result"], json!([5]));
    }

    #[tokio::test]
    async fn handler_fault_keeps_code_and_reports_event() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher().with_event_sink(sink.clone());

        let response = call(
            &dispatcher,
            r#"[{"jsonrpc":"2.0","method":"Calc.Fail","id":1},{"jsonrpc":"2.0","method":"Calc.Add","params":[1],"id":2}]"#,
        )
        .await;

        assert_eq!(by_id(&response, json!(1))["error"]["code"], 1001);
        assert_eq!(
            by_id(&response, json!(1))["error"]["message"],
            "insufficient funds"
        );
        assert_eq!(by_id(&response, json!(2))["result"], json!([1]));

        let events = sink.events.lock().expect("sink lock");
        assert_eq!(events.len(), 2);
        let failed = events
            .iter()
            .find(|event| event.method == "Calc.Fail")
            .expect("fail event");
        assert_eq!(failed.error.as_deref(), Some("[1001] insufficient funds"));
        assert!(events
            .iter()
            .any(|event| event.method == "Calc.Add" && event.error.is_none()));
    }

    #[tokio::test]
    async fn handler_panic_becomes_code_zero_error() {
        let response = call(
            &dispatcher(),
            r#"[{"jsonrpc":"2.0","method":"Calc.Boom","id":1},{"jsonrpc":"2.0","method":"Calc.Add","params":[1],"id":2}]"#,
        )
        .await;

        assert_eq!(response.as_array().map(Vec::len), Some(2));
        let failed = by_id(&response, json!(1));
        assert_eq!(failed["error"]["code"], 0);
        assert_eq!(failed["error"]["message"], "handler panicked: exploded");
    }

    #[tokio::test]
    async fn slow_and_fast_handlers_are_assembled_together() {
        let dispatcher = dispatcher();
        let requests = vec![
            Request::new("Calc.Slow", vec![], Some(json!("slow"))),
            Request::new("Calc.Add", vec![json!(1)], Some(json!("fast"))),
        ];

        let responses = dispatcher.process(requests).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Some(json!("fast")));
        assert_eq!(
            responses[1].outcome,
            Outcome::Result(json!(["slow"]))
        );
    }

    #[test]
    fn validate_checks_version_method_and_id() {
        assert!(validate(&Request::new("A.b", vec![], Some(json!(1)))).is_ok());
        assert!(validate(&Request::new("A.b", vec![], None)).is_ok());
        assert!(validate(&Request::default()).is_err());

        let mut boolean_id = Request::new("A.b", vec![], None);
        boolean_id.id = Some(json!(true));
        assert!(validate(&boolean_id).is_err());
    }
}
