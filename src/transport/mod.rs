//! Tool transport: how proposed tool calls reach the system under test.
//!
//! The target exposes a JSON-RPC 2.0 service over a length-prefixed stream
//! (`tools/list`, `tools/call`). [`RpcClient`] is the production
//! implementation; [`MockTransport`] is a scripted stand-in for tests and
//! local experiments.

pub mod client;
pub mod mock;
pub mod wire;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub use self::client::{ClientSettings, Connector, EndpointConnector, RpcClient};
pub use self::mock::MockTransport;

/// One tool advertised by the target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
    /// The target itself asks for a human before this tool runs.
    #[serde(default)]
    pub requires_confirmation: bool,
}

fn empty_schema() -> Value {
    json!({"type": "object"})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("invalid endpoint '{0}': expected tcp://host:port or unix:///path")]
    InvalidEndpoint(String),
    #[error("connection to target lost")]
    ConnectionLost,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("target unavailable: {0}")]
    Unavailable(String),
    #[error("target returned error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Worth retrying with the same call. `Unavailable` counts: the next
    /// call starts a fresh round of reconnect attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost
                | TransportError::Timeout(_)
                | TransportError::Unavailable(_)
        )
    }
}

/// Where the target system listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());

        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        Err(invalid())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Request/response channel to the system under test.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Raw JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    async fn capabilities(&self) -> Result<Vec<ToolCapability>, TransportError> {
        let result = self.call("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools)
            .map_err(|e| TransportError::Protocol(format!("bad tools/list result: {}", e)))
    }

    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.call("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "tcp://127.0.0.1:7400".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7400".into())
        );
        assert_eq!(
            "unix:///run/target.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/target.sock"))
        );
        assert!("tcp://nohost".parse::<Endpoint>().is_err());
        assert!("tcp://:80".parse::<Endpoint>().is_err());
        assert!("unix://relative.sock".parse::<Endpoint>().is_err());
        assert!("http://x:1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        for s in ["tcp://target.local:9000", "unix:///tmp/t.sock"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::ConnectionLost.is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(TransportError::Unavailable("down".into()).is_transient());
        assert!(!TransportError::Remote { code: -32000, message: "nope".into() }.is_transient());
    }

    #[test]
    fn test_capability_defaults() {
        let cap: ToolCapability = serde_json::from_value(json!({"name": "read_file"})).unwrap();
        assert!(!cap.requires_confirmation);
        assert_eq!(cap.input_schema["type"], "object");
    }
}
