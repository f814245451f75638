//! Framed TCP transport for the JSON-RPC dispatcher
//!
//! Every message is a JSON payload followed by the end-of-message delimiter. Each inbound
//! frame is dispatched on its own task and its response is queued on the connection's
//! send loop.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    rpc::{
        dispatcher::Dispatcher,
        message::{self, Response, RpcError, EOF, MAX_FRAME_LEN},
        send_loop::SendLoop,
    },
};

pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub async fn bind(config: &Config, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let addr = config
            .tcp_socket()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        set_reuse_port(&socket, config.reuse_port)?;
        socket.bind(addr)?;

        Ok(Self::from_listener(socket.listen(1024)?, dispatcher))
    }

    pub fn from_listener(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            listener,
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops the accept loop. In-flight connections keep running.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn serve(&self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "tcp json-rpc server accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        debug!(peer = %peer, "connection opened");
                        serve_tcp_stream(stream, dispatcher).await;
                        debug!(peer = %peer, "connection closed");
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            }
        }

        info!("tcp json-rpc server stopped accepting connections");
        Ok(())
    }
}

#[cfg(unix)]
fn set_reuse_port(socket: &TcpSocket, enabled: bool) -> io::Result<()> {
    socket.set_reuseport(enabled)
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &TcpSocket, _enabled: bool) -> io::Result<()> {
    Ok(())
}

async fn serve_tcp_stream(stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    handle_connection(reader, writer, dispatcher).await;
}

/// Serves one connection until the peer closes it or a read or write fails.
///
/// A frame larger than [`MAX_FRAME_LEN`] is answered with a parse error and ends the connection.
pub async fn handle_connection<R, W>(reader: R, writer: W, dispatcher: Arc<Dispatcher>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let closed = CancellationToken::new();
    let send_loop = SendLoop::spawn(writer, closed.clone());
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = message::read_frame(&mut reader, &mut buffer, MAX_FRAME_LEN) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let content = strip_delimiter(&buffer);
                if content.is_empty() {
                    continue;
                }

                let content = content.to_vec();
                let dispatcher = Arc::clone(&dispatcher);
                let outbound = send_loop.outbound();
                tokio::spawn(async move {
                    let payload = dispatcher.handle(&content).await;
                    if !outbound.push(message::frame(payload)) {
                        debug!("connection closed before response could be queued");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, limit = MAX_FRAME_LEN, "oversized frame, closing connection");
                let payload = message::encode(true, &[Response::error(RpcError::parse_error(), None)]);
                send_loop.outbound().push(message::frame(payload));
                break;
            }
            Err(err) => {
                debug!(error = %err, "read failed, closing connection");
                break;
            }
        }
    }

    send_loop.finish().await;
}

fn strip_delimiter(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(EOF).unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::rpc::registry::{MethodRegistry, Service, ServiceError};

    struct Clock;

    #[async_trait]
    impl Service for Clock {
        fn name(&self) -> &str {
            "Clock"
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["Wait", "Now"]
        }

        async fn call(&self, operation: &str, params: Vec<Value>) -> Result<Value, ServiceError> {
            if operation == "Wait" {
                let millis = params.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            Ok(json!(operation))
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            MethodRegistry::builder().register(Arc::new(Clock)).build(),
        ))
    }

    async fn start() -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = RpcServer::from_listener(listener, dispatcher());
        let addr = server.local_addr().expect("addr");
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move { server.serve().await });
        (addr, shutdown)
    }

    #[tokio::test]
    async fn batch_with_slow_handler_is_sent_as_one_frame() {
        let (addr, shutdown) = start().await;
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(
                b"[{\"jsonrpc\":\"2.0\",\"method\":\"Clock.Wait\",\"params\":[100],\"id\":1},{\"jsonrpc\":\"2.0\",\"method\":\"Clock.Now\",\"id\":2}]\n",
            )
            .await
            .expect("write");

        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("response in time")
            .expect("read")
            .expect("line");
        let response: Value = serde_json::from_str(&line).expect("json");

        let responses = response.as_array().expect("batch");
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().any(|r| r["id"] == 1 && r["result"] == json!(["Wait"])));
        assert!(responses.iter().any(|r| r["id"] == 2 && r["result"] == json!(["Now"])));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn parse_error_does_not_close_connection() {
        let (addr, shutdown) = start().await;
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"[{oops\n").await.expect("write");
        let first: Value =
            serde_json::from_str(&lines.next_line().await.expect("read").expect("line"))
                .expect("json");
        assert_eq!(first["error"]["code"], -32700);
        assert_eq!(first["id"], Value::Null);

        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"Clock.Now\",\"id\":\"n\"}\r\n")
            .await
            .expect("write");
        let second: Value =
            serde_json::from_str(&lines.next_line().await.expect("read").expect("line"))
                .expect("json");
        assert_eq!(second["id"], "n");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = RpcServer::from_listener(listener, dispatcher());
        let serving = tokio::spawn(async move {
            let shutdown = server.shutdown_handle();
            let task = server.serve();
            shutdown.cancel();
            task.await
        });

        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("serve returns after shutdown")
            .expect("join")
            .expect("serve");
    }

    #[tokio::test]
    async fn peer_close_ends_connection_quietly() {
        let (client, server) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(server);
        drop(client);

        tokio::time::timeout(
            Duration::from_secs(1),
            handle_connection(reader, writer, dispatcher()),
        )
        .await
        .expect("connection ends on eof");
    }

    #[tokio::test]
    async fn oversized_frame_gets_parse_error_and_closes() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let (client_reader, mut client_writer) = tokio::io::split(client);

        tokio::spawn(async move {
            let flood = vec![b'x'; MAX_FRAME_LEN + 64];
            let _ = client_writer.write_all(&flood).await;
            client_writer
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            handle_connection(reader, writer, dispatcher()),
        )
        .await
        .expect("connection ends on oversized frame");

        let mut lines = BufReader::new(client_reader).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("response in time")
            .expect("read")
            .expect("line");
        let response: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }
}
