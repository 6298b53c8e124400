//! Gateway error types.
//!
//! One variant per failure class a backend or the upstream endpoint can
//! produce. Backend-local failures never abort the gateway; only
//! [`McpError::Upstream`] is fatal to the process.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    /// Malformed or missing configuration. The gateway falls back to defaults.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or handshake failure while opening a backend session.
    #[error("[{backend}] connection failed: {message}")]
    Connect { backend: String, message: String },

    /// Capability query failed after a successful handshake.
    #[error("[{backend}] tool discovery failed: {message}")]
    Discovery { backend: String, message: String },

    /// A forwarded call failed.
    #[error("[{backend}/{capability}] {message}")]
    Invocation {
        backend: String,
        capability: String,
        message: String,
    },

    /// Call attempted against a backend with no live connection.
    #[error("Backend not connected: {0}")]
    NotConnected(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// The session to the backend broke (closed pipe, send failure, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend answered with a protocol-level error; the session is alive.
    #[error("Backend error: {0}")]
    Remote(String),

    /// The upstream endpoint could not be opened.
    #[error("Upstream endpoint failed: {0}")]
    Upstream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl McpError {
    /// True for failures that mean the session itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport(_) | McpError::Io(_))
    }

    /// Short machine-readable tag, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::Config(_) => "config_error",
            McpError::Connect { .. } => "connect_error",
            McpError::Discovery { .. } => "discovery_error",
            McpError::Invocation { .. } => "invocation_error",
            McpError::NotConnected(_) => "not_connected",
            McpError::BackendNotFound(_) => "backend_not_found",
            McpError::Transport(_) => "transport_error",
            McpError::Remote(_) => "backend_error",
            McpError::Upstream(_) => "upstream_error",
            McpError::Io(_) => "io_error",
        }
    }
}

impl From<rmcp::ServiceError> for McpError {
    fn from(err: rmcp::ServiceError) -> Self {
        match err {
            rmcp::ServiceError::McpError(data) => McpError::Remote(data.message.to_string()),
            other => McpError::Transport(other.to_string()),
        }
    }
}
