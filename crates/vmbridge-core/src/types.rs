//! Domain types shared by the client, the supervisor and the CLI.

use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────

/// Address of one running VM Service instance.
///
/// The optional `token` is the auth code Flutter embeds as the first path
/// segment of the service URI (`http://127.0.0.1:50300/Yq2i4ZRyWqc=/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    /// Parse a VM Service URI as printed by `flutter run` or the daemon's
    /// `app.debugPort` event.
    ///
    /// Accepts `ws://` and `http://` forms, with or without the trailing
    /// `/ws` segment:
    ///
    /// - `ws://127.0.0.1:8181/ws`
    /// - `ws://127.0.0.1:50300/Yq2i4ZRyWqc=/ws`
    /// - `http://127.0.0.1:50300/Yq2i4ZRyWqc=/`
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri.trim())
            .map_err(|e| Error::invalid_endpoint(format!("{uri}: {e}")))?;

        match url.scheme() {
            "ws" | "http" => {}
            other => {
                return Err(Error::invalid_endpoint(format!(
                    "unsupported scheme '{other}' in {uri}"
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_endpoint(format!("missing host in {uri}")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_endpoint(format!("missing port in {uri}")))?;

        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.last() == Some(&"ws") {
            segments.pop();
        }

        let token = match segments.as_slice() {
            [] => None,
            [token] => Some((*token).to_string()),
            _ => {
                return Err(Error::invalid_endpoint(format!(
                    "unexpected path in {uri}"
                )))
            }
        };

        Ok(Self { host, port, token })
    }

    /// The WebSocket URI: `ws://<host>:<port>/<token>/ws`.
    pub fn ws_uri(&self) -> String {
        match &self.token {
            Some(token) => format!("ws://{}:{}/{}/ws", self.host, self.port, token),
            None => format!("ws://{}:{}/ws", self.host, self.port),
        }
    }

    /// Stable identity used to key recovery records.
    pub fn target_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ws_uri())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_uri(s)
    }
}

// ─────────────────────────────────────────────────────────────────
// ConnectionStatus
// ─────────────────────────────────────────────────────────────────

/// Coarse liveness reported to outer layers (REST, CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// MemoryUsage
// ─────────────────────────────────────────────────────────────────

/// Heap memory usage snapshot from the Dart VM.
///
/// Returned by `getMemoryUsage(isolateId)`. All values are in bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Current heap usage in bytes (amount currently allocated).
    pub heap_usage: u64,
    /// Total heap capacity in bytes (amount the VM has reserved from the OS).
    pub heap_capacity: u64,
    /// External memory usage in bytes (images, native buffers with finalizers).
    pub external_usage: u64,
    /// Timestamp when this snapshot was taken.
    pub timestamp: chrono::DateTime<chrono::Local>,
}

impl MemoryUsage {
    /// Heap utilization as a fraction (0.0–1.0).
    pub fn utilization(&self) -> f64 {
        if self.heap_capacity == 0 {
            return 0.0;
        }
        self.heap_usage as f64 / self.heap_capacity as f64
    }

    /// Total memory (heap + external) in bytes.
    pub fn total(&self) -> u64 {
        self.heap_usage + self.external_usage
    }
}
