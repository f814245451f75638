//! Local view of the discovery registry
//!
//! Applies watch events to a key/value snapshot and exposes it as the `Catalog` RPC service.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    discovery::watcher::{WatchEvent, WatchHandler},
    rpc::registry::{Service, ServiceError},
};

pub const NOT_FOUND: i64 = 404;

#[derive(Debug, Default)]
pub struct Catalog {
    entries: RwLock<BTreeMap<String, String>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, change: &Value) {
        let Some(key) = change["kv"]["key"].as_str().and_then(decode) else {
            warn!("watch change without a decodable key");
            return;
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if change["type"] == "DELETE" {
            debug!(key = %key, "service entry removed");
            entries.remove(&key);
        } else {
            let value = change["kv"]["value"]
                .as_str()
                .and_then(decode)
                .unwrap_or_default();
            debug!(key = %key, "service entry updated");
            entries.insert(key, value);
        }
    }
}

impl WatchHandler for Catalog {
    fn on_event(&self, event: WatchEvent) {
        let Some(changes) = event["result"]["events"].as_array() else {
            return;
        };
        for change in changes {
            self.apply(change);
        }
    }
}

#[async_trait]
impl Service for Catalog {
    fn name(&self) -> &str {
        "Catalog"
    }

    fn operations(&self) -> Vec<&'static str> {
        vec!["List", "Get"]
    }

    async fn call(&self, operation: &str, params: Vec<Value>) -> Result<Value, ServiceError> {
        match operation {
            "List" => Ok(json!(self.snapshot())),
            "Get" => {
                let key = params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::new("key must be a string"))?;
                self.get(key)
                    .map(Value::String)
                    .ok_or_else(|| ServiceError::with_code(NOT_FOUND, format!("no entry for {key}")))
            }
            _ => Err(ServiceError::new(format!("unknown operation {operation}"))),
        }
    }
}

fn decode(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}
