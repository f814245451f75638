//! Prefix watch against an etcd v3 gateway
//!
//! A `Watcher` owns at most one live connection at a time. `forever` keeps re-issuing the
//! watch with a fixed backoff until `close` is called.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    discovery::{
        dialer::{Dialer, TcpDialer},
        endpoint::Endpoint,
    },
    errors::WatchError,
    rpc::message::{self, MAX_FRAME_LEN},
};

pub const WATCH_PATH: &str = "/v3/watch";
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const CLOSE_POLL_ATTEMPTS: u32 = 4;
pub const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One decoded change notification; always carries a `result` field.
pub type WatchEvent = Value;

pub trait WatchHandler: Send + Sync {
    fn on_event(&self, event: WatchEvent);
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub connect_timeout: Duration,
    pub retry_backoff: Duration,
    pub close_poll_attempts: u32,
    pub close_poll_interval: Duration,
    /// Longest accepted line on the watch stream.
    pub max_frame_len: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
            close_poll_attempts: CLOSE_POLL_ATTEMPTS,
            close_poll_interval: CLOSE_POLL_INTERVAL,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Exclusive end of the key range covering every key that starts with `prefix`.
///
/// Trailing `0xff` bytes are dropped before incrementing. When nothing is left to
/// increment the result is `[0x00]`, which etcd reads as "no upper bound".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

pub fn build_watch_request(endpoint: &Endpoint, prefix: &[u8]) -> Vec<u8> {
    let body = json!({
        "create_request": {
            "key": STANDARD.encode(prefix),
            "range_end": STANDARD.encode(prefix_range_end(prefix)),
        }
    })
    .to_string();

    format!(
        "POST {WATCH_PATH} HTTP/1.1\r\n\
         Host: {endpoint}\r\n\
         Accept: */*\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Content-Length: {}\r\n\
         Content-Type: application/json\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

pub struct Watcher {
    endpoint: Endpoint,
    prefix: Vec<u8>,
    handler: Arc<dyn WatchHandler>,
    dialer: Arc<dyn Dialer>,
    options: WatchOptions,
    closed: AtomicBool,
    watching: AtomicBool,
    connection: Mutex<Option<CancellationToken>>,
}

impl Watcher {
    pub fn new(
        endpoint: &str,
        prefix: impl Into<Vec<u8>>,
        handler: Arc<dyn WatchHandler>,
        options: WatchOptions,
    ) -> Result<Self, WatchError> {
        let endpoint = Endpoint::parse(endpoint)?;
        let dialer = Arc::new(TcpDialer::new(endpoint.clone(), options.connect_timeout));
        Ok(Self::with_dialer(endpoint, prefix, handler, dialer, options))
    }

    pub fn with_dialer(
        endpoint: Endpoint,
        prefix: impl Into<Vec<u8>>,
        handler: Arc<dyn WatchHandler>,
        dialer: Arc<dyn Dialer>,
        options: WatchOptions,
    ) -> Self {
        Self {
            endpoint,
            prefix: prefix.into(),
            handler,
            dialer,
            options,
            closed: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            connection: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Starts the retry loop on a background task.
    ///
    /// Returns `None` when the loop was already started.
    pub fn forever(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.watching.swap(true, Ordering::SeqCst) {
            warn!(endpoint = %self.endpoint, "discovery watch already running");
            return None;
        }
        let watcher = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!(endpoint = %watcher.endpoint, "discovery watch started");
            while !watcher.is_closed() {
                if let Err(err) = watcher.watch().await {
                    error!(
                        timestamp = %Utc::now().to_rfc3339(),
                        code = err.code(),
                        error = %err,
                        origin = module_path!(),
                        "discovery watch failed"
                    );
                }
                tokio::time::sleep(watcher.options.retry_backoff).await;
            }
            info!(endpoint = %watcher.endpoint, "discovery watch stopped");
        }))
    }

    /// Runs one watch over a fresh connection until the stream ends or `close` is called.
    pub async fn watch(&self) -> Result<(), WatchError> {
        let stream = self
            .dialer
            .dial()
            .await
            .map_err(|source| WatchError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            })?;

        let connection = CancellationToken::new();
        *self.connection.lock().await = Some(connection.clone());
        if self.is_closed() {
            return Ok(());
        }

        let (reader, mut writer) = tokio::io::split(stream);
        writer
            .write_all(&build_watch_request(&self.endpoint, &self.prefix))
            .await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut frame = Vec::new();
        loop {
            frame.clear();
            let read = tokio::select! {
                _ = connection.cancelled() => {
                    debug!("discovery connection closed");
                    return Ok(());
                }
                read = message::read_frame(&mut reader, &mut frame, self.options.max_frame_len) => read?,
            };

            if read == 0 || frame == b"\n" {
                debug!("discovery stream ended");
                return Ok(());
            }
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        if !frame.windows(6).any(|window| window == b"result") {
            return;
        }

        match serde_json::from_slice::<Value>(frame) {
            Ok(event) if !is_empty(&event) => self.handler.on_event(event),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "discarding undecodable watch frame"),
        }
    }

    /// Stops the retry loop and closes the live connection.
    ///
    /// If no connection exists yet, waits a bounded number of poll intervals for one to
    /// appear and gives up silently otherwise.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.is_watching() {
            return;
        }

        if self.close_connection().await {
            return;
        }
        for _ in 0..self.options.close_poll_attempts {
            tokio::time::sleep(self.options.close_poll_interval).await;
            if self.close_connection().await {
                return;
            }
        }
    }

    async fn close_connection(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(connection) => {
                connection.cancel();
                true
            }
            None => false,
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
