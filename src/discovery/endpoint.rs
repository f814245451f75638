use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::errors::WatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

fn endpoint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:https?://)?(?P<host>\[[0-9A-Fa-f:.]+\]|[^:/\s\[\]]+):(?P<port>\d{1,5})(?:/.*)?$")
            .expect("valid endpoint pattern")
    })
}

impl Endpoint {
    /// Accepts `host:port` with an optional `http://` scheme and trailing path.
    pub fn parse(endpoint: &str) -> Result<Self, WatchError> {
        let invalid = || WatchError::InvalidEndpoint(endpoint.to_string());
        let captures = endpoint_pattern()
            .captures(endpoint.trim())
            .ok_or_else(invalid)?;

        let host = captures
            .name("host")
            .map(|host| host.as_str().trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(invalid)?;
        let port = captures
            .name("port")
            .and_then(|port| port.as_str().parse::<u16>().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
