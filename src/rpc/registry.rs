//! Service registration and method lookup
//!
//! A `RegistryBuilder` collects services during startup and yields an immutable
//! `MethodRegistry` keyed by `"Service.Operation"`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Fault raised by a service operation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub code: Option<i64>,
    pub message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// An object exposing a set of invocable operations.
#[async_trait]
pub trait Service: Send + Sync {
    /// Type name used as the first half of every method key.
    fn name(&self) -> &str;

    /// Public operations, used as the second half of every method key.
    fn operations(&self) -> Vec<&'static str>;

    async fn call(&self, operation: &str, params: Vec<Value>) -> Result<Value, ServiceError>;
}

/// A service bound to one of its operations.
#[derive(Clone)]
pub struct BoundHandler {
    service: Arc<dyn Service>,
    operation: &'static str,
}

impl BoundHandler {
    pub async fn invoke(&self, params: Vec<Value>) -> Result<Value, ServiceError> {
        self.service.call(self.operation, params).await
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    services: Vec<Arc<dyn Service>>,
    callables: HashMap<String, BoundHandler>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every operation of `service`. A later registration for the same key replaces
    /// the earlier one.
    pub fn register(mut self, service: Arc<dyn Service>) -> Self {
        for operation in service.operations() {
            let key = method_key(service.name(), operation);
            if self.callables.contains_key(&key) {
                tracing::debug!(method = %key, "replacing previously registered method");
            }
            self.callables.insert(
                key,
                BoundHandler {
                    service: Arc::clone(&service),
                    operation,
                },
            );
        }
        self.services.push(service);
        self
    }

    pub fn build(self) -> MethodRegistry {
        MethodRegistry {
            services: self.services,
            callables: self.callables,
        }
    }
}

pub struct MethodRegistry {
    services: Vec<Arc<dyn Service>>,
    callables: HashMap<String, BoundHandler>,
}

impl MethodRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, method: &str) -> Option<&BoundHandler> {
        self.callables.get(method)
    }

    /// Distinct lower-cased service names, in registration order.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let name = service.name().to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Every registered method key, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.callables.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

pub fn method_key(service: &str, operation: &str) -> String {
    format!("{service}.{operation}")
}
