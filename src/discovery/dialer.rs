use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::discovery::endpoint::Endpoint;

/// Byte stream produced by a dialer.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Produces new connections to a backend.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<Box<dyn Connection>>;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    endpoint: Endpoint,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Box<dyn Connection>> {
        let address = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
