use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "/micro/registry/";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
    pub reuse_port: bool,
    pub discovery_endpoint: Option<String>,
    pub discovery_prefix: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RPC_PORT must be a valid u16")]
    InvalidPort,
    #[error("RPC_HTTP_PORT must be a valid u16")]
    InvalidHttpPort,
    #[error("RPC_REUSE_PORT must be true or false")]
    InvalidReusePort,
    #[error("DISCOVERY_PREFIX must not be empty")]
    EmptyPrefix,
    #[error("DISCOVERY_CONNECT_TIMEOUT_SECS must be a positive integer")]
    InvalidConnectTimeout,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("RPC_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_var("RPC_PORT", ConfigError::InvalidPort)?.unwrap_or(9501);
        let http_port = parse_var("RPC_HTTP_PORT", ConfigError::InvalidHttpPort)?.unwrap_or(9502);
        let reuse_port = env::var("RPC_REUSE_PORT")
            .ok()
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::InvalidReusePort),
            })
            .transpose()?
            .unwrap_or(false);
        let discovery_endpoint = env::var("DISCOVERY_ENDPOINT")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let discovery_prefix = match env::var("DISCOVERY_PREFIX") {
            Ok(value) if value.is_empty() => return Err(ConfigError::EmptyPrefix),
            Ok(value) => value,
            Err(_) => DEFAULT_DISCOVERY_PREFIX.to_string(),
        };
        let connect_timeout = parse_var::<u64>(
            "DISCOVERY_CONNECT_TIMEOUT_SECS",
            ConfigError::InvalidConnectTimeout,
        )?
        .map(|secs| {
            if secs == 0 {
                Err(ConfigError::InvalidConnectTimeout)
            } else {
                Ok(Duration::from_secs(secs))
            }
        })
        .transpose()?
        .unwrap_or(Duration::from_secs(3));

        let config = Self {
            host,
            port,
            http_port,
            reuse_port,
            discovery_endpoint,
            discovery_prefix,
            connect_timeout,
        };

        let _ = config.tcp_socket()?;
        Ok(config)
    }

    pub fn tcp_socket(&self) -> Result<SocketAddr, ConfigError> {
        socket(&self.host, self.port)
    }

    pub fn http_socket(&self) -> Result<SocketAddr, ConfigError> {
        socket(&self.host, self.http_port)
    }
}

fn socket(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidSocket)
}

fn parse_var<T: std::str::FromStr>(name: &str, err: ConfigError) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|_| err),
        Err(_) => Ok(None),
    }
}
