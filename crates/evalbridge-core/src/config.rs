//! Configuration for evalbridge.
//!
//! Protocol constants live on [`ProtocolConfig`]; per-session options live on
//! [`BridgeConfig`], which can be built in code or loaded from a JSON file.

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Wire and runtime constants shared by both ends of the bridge.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const DEFAULT_ADDRESS: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 9001;

    /// Largest single message accepted from the remote host.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Remote peers served at once. The protocol is single-flight per connection.
    pub const MAX_PEERS: usize = 1;

    /// Units every remote host carries as part of its bootstrap.
    pub const RUNTIME_SUPPORT_UNITS: &'static [&'static str] = &["evalbridge.runtime"];

    /// Remote variable receiving errors trapped by the payload wrapper.
    pub const ERROR_VAR: &'static str = "globalThis.__evalbridge_error";

    /// Remote variable receiving the rendered value of a staged expression.
    pub const RESULT_VAR: &'static str = "globalThis.__evalbridge_result";

    pub const DEFAULT_RENDER_SIGNATURE: &'static str = "evalbridge.runtime.render(";
    pub const DEFAULT_INIT_NAMESPACE: &'static str = "repl.user";

    pub const STAGED_FILE_PREFIX: &'static str = "evalbridge-";
    pub const STAGED_FILE_SUFFIX: &'static str = ".js";

    pub const WS_ROUTE: &'static str = "/repl";
    pub const HEALTH_ROUTE: &'static str = "/health";
}

/// How evaluation payloads reach the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStrategy {
    /// Code travels inside the message body.
    #[default]
    Inline,
    /// Code is written to a file and only the path travels.
    StagedFile,
}

impl DeliveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStrategy::Inline => "inline",
            DeliveryStrategy::StagedFile => "staged-file",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "inline" => Some(DeliveryStrategy::Inline),
            "staged-file" | "staged" | "file" => Some(DeliveryStrategy::StagedFile),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which listener the remote host connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed JSON frames over TCP.
    #[default]
    Tcp,
    /// JSON text frames over a WebSocket.
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(TransportKind::Tcp),
            "websocket" | "ws" => Some(TransportKind::WebSocket),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for one bridge session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listen address.
    pub address: String,
    /// Listen port (0 = OS-assigned).
    pub port: u16,
    /// Extra units to treat as already present on the remote host.
    pub preloaded_units: Vec<String>,
    /// Source tree analyzed once at setup.
    pub source_root: Option<PathBuf>,
    pub delivery_strategy: DeliveryStrategy,
    /// Directory for staged payload files (defaults to the system temp dir).
    pub staging_dir: Option<PathBuf>,
    pub transport: TransportKind,
    /// Namespace initialized on the remote host after every ready handshake.
    pub init_namespace: String,
    /// Call signature marking code whose value must be captured.
    pub render_signature: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: ProtocolConfig::DEFAULT_ADDRESS.to_string(),
            port: ProtocolConfig::DEFAULT_PORT,
            preloaded_units: Vec::new(),
            source_root: None,
            delivery_strategy: DeliveryStrategy::default(),
            staging_dir: None,
            transport: TransportKind::default(),
            init_namespace: ProtocolConfig::DEFAULT_INIT_NAMESPACE.to_string(),
            render_signature: ProtocolConfig::DEFAULT_RENDER_SIGNATURE.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| BridgeError::io_with_path(e, path))?;
        serde_json::from_str(&text).map_err(|e| BridgeError::Config {
            message: format!("Invalid config {}: {}", path.display(), e),
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_preloaded_units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preloaded_units = units.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn with_delivery_strategy(mut self, strategy: DeliveryStrategy) -> Self {
        self.delivery_strategy = strategy;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Resolve `address:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| BridgeError::Config {
                message: format!("Invalid listen address {}:{}: {}", self.address, self.port, e),
            })
    }

    /// Directory staged payloads are written to.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
