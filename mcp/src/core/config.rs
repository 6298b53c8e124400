//! Gateway configuration types and loading.
//!
//! Defines the backend descriptor list and the gateway-level settings. Loading
//! never fails: a missing or malformed file falls back to an empty backend set.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{McpError, McpResult};

/// Separator between backend name and capability name in qualified names.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Connect deadline applied when a descriptor does not set `timeout`.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// File names tried, in order, when no explicit path is given.
const CONFIG_FILE_NAMES: [&str; 2] = ["gateway.config.json", ".mcp-gateway.json"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Backends to aggregate.
    #[serde(default)]
    pub servers: Vec<BackendDescriptor>,

    /// Expose proxies as `<backend>__<tool>` (true) or bare `<tool>` (false).
    #[serde(default = "default_true")]
    pub use_namespace: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Immutable description of one backend.
#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub name: String,

    #[serde(flatten)]
    pub transport: BackendTransport,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Connect deadline in milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum BackendTransport {
    /// Spawned child process speaking MCP over its stdin/stdout.
    Stdio {
        #[serde(default)]
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// HTTP with server-sent events.
    Http {
        #[serde(default)]
        url: String,
    },
    /// Streamable HTTP.
    Streamable {
        #[serde(default)]
        url: String,
    },
}

impl BackendTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendTransport::Stdio { .. } => "stdio",
            BackendTransport::Http { .. } => "http",
            BackendTransport::Streamable { .. } => "streamable",
        }
    }
}

impl fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTransport::Stdio { command, args, env } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .finish(),
            BackendTransport::Http { url } => f.debug_struct("Http").field("url", url).finish(),
            BackendTransport::Streamable { url } => {
                f.debug_struct("Streamable").field("url", url).finish()
            }
        }
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("timeout_ms", &self.timeout_ms)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl BackendDescriptor {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            BackendTransport::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
            },
        )
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(name, BackendTransport::Http { url: url.into() })
    }

    fn with_transport(name: impl Into<String>, transport: BackendTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            auto_reconnect: true,
            timeout_ms: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    /// Qualified, collision-free name of one of this backend's capabilities.
    pub fn qualify(&self, capability: &str) -> String {
        qualified_name(&self.name, capability)
    }
}

pub fn qualified_name(backend: &str, capability: &str) -> String {
    format!("{}{}{}", backend, NAMESPACE_SEPARATOR, capability)
}

fn default_name() -> String {
    "mcp-gateway".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            servers: Vec::new(),
            use_namespace: true,
            log_level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// Parse a config file. YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn from_file(path: &Path) -> McpResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml"));

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| McpError::Config(e.to_string()))?
        } else {
            serde_json::from_str(&content).map_err(|e| McpError::Config(e.to_string()))?
        };
        Ok(config.normalized())
    }

    /// Load from the first usable candidate, or fall back to defaults.
    ///
    /// Candidates: `explicit`, then `./gateway.config.json`,
    /// `./.mcp-gateway.json`, `~/.mcp-gateway.json`.
    pub fn load(explicit: Option<&Path>) -> Self {
        for candidate in Self::candidates(explicit) {
            if !candidate.is_file() {
                continue;
            }
            match Self::from_file(&candidate) {
                Ok(config) => {
                    info!(path = %candidate.display(), "Loaded gateway config");
                    return config;
                }
                Err(e) => {
                    error!(path = %candidate.display(), error = %e, "Failed to parse gateway config");
                }
            }
        }

        warn!("No usable config file found, using defaults");
        Self::default()
    }

    fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = explicit.map(Path::to_path_buf).into_iter().collect();
        if let Ok(cwd) = std::env::current_dir() {
            candidates.extend(CONFIG_FILE_NAMES.iter().map(|name| cwd.join(name)));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".mcp-gateway.json"));
        }
        candidates
    }

    /// Drop descriptors whose name repeats an earlier one.
    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.servers.retain(|server| {
            if !seen.insert(server.name.clone()) {
                warn!(backend = %server.name, "Duplicate backend name in config, ignoring");
                return false;
            }
            if server.name.contains(NAMESPACE_SEPARATOR) {
                warn!(
                    backend = %server.name,
                    "Backend name contains '{}', qualified names may be ambiguous",
                    NAMESPACE_SEPARATOR
                );
            }
            true
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let json = r#"{"name": "calc", "transport": "stdio", "command": "calc-tool"}"#;
        let desc: BackendDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(desc.name, "calc");
        assert!(desc.enabled);
        assert!(desc.auto_reconnect);
        assert_eq!(desc.connect_timeout(), Duration::from_millis(15_000));
        match desc.transport {
            BackendTransport::Stdio { command, args, env } => {
                assert_eq!(command, "calc-tool");
                assert!(args.is_empty());
                assert!(env.is_empty());
            }
            _ => panic!("expected stdio transport"),
        }
    }

    #[test]
    fn test_http_descriptor_with_overrides() {
        let json = r#"{
            "name": "docs",
            "transport": "http",
            "url": "http://localhost:3001/sse",
            "autoReconnect": false,
            "timeout": 500,
            "enabled": false
        }"#;
        let desc: BackendDescriptor = serde_json::from_str(json).unwrap();

        assert!(!desc.auto_reconnect);
        assert!(!desc.enabled);
        assert_eq!(desc.connect_timeout(), Duration::from_millis(500));
        assert_eq!(desc.transport.kind(), "http");
    }

    #[test]
    fn test_gateway_config_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.name, "mcp-gateway");
        assert_eq!(config.version, "1.0.0");
        assert!(config.use_namespace);
        assert_eq!(config.log_level, "info");
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_duplicate_backend_names_dropped() {
        let config = GatewayConfig {
            servers: vec![
                BackendDescriptor::stdio("calc", "first"),
                BackendDescriptor::stdio("calc", "second"),
                BackendDescriptor::http("docs", "http://localhost/sse"),
            ],
            ..GatewayConfig::default()
        }
        .normalized();

        assert_eq!(config.servers.len(), 2);
        match &config.servers[0].transport {
            BackendTransport::Stdio { command, .. } => assert_eq!(command, "first"),
            _ => panic!("expected stdio transport"),
        }
    }

    #[test]
    fn test_qualified_name() {
        let desc = BackendDescriptor::stdio("calc", "calc-tool");
        assert_eq!(desc.qualify("add"), "calc__add");
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "name: test-gw\nuseNamespace: false\nservers:\n  - name: calc\n    transport: stdio\n    command: calc-tool\n    args: [\"--fast\"]"
        )
        .unwrap();

        let config = GatewayConfig::load(Some(file.path()));
        assert_eq!(config.name, "test-gw");
        assert!(!config.use_namespace);
        assert_eq!(config.servers.len(), 1);
    }

    #[test]
    fn test_from_file_malformed_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = GatewayConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
    }
}
