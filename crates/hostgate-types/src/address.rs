use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Host used before the backend has reported anything
pub const DEFAULT_BACKEND_HOST: &str = "localhost";

/// Current listen address of the backend service.
///
/// A port of `0` means the backend has not announced itself yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The unset address, `localhost:0`
    pub fn unset() -> Self {
        Self::new(DEFAULT_BACKEND_HOST, 0)
    }

    pub fn is_set(&self) -> bool {
        self.port != 0
    }

    /// `host:port`, suitable for a `Host` header
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl Default for BackendAddress {
    fn default() -> Self {
        Self::unset()
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

/// Status document the backend writes into the readiness file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadinessMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub server: ServerStatus,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ReadinessMessage {
    pub fn listen_ip(&self) -> &str {
        &self.server.listen.ip
    }

    pub fn listen_port(&self) -> u16 {
        self.server.listen.port
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub listen: ListenAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenAddress {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}
