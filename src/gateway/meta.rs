//! Gateway meta-operations: names, declarations and report shapes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rmcp::model::Tool;
use serde::Serialize;
use serde_json::{json, Map, Value};
use toolgate_mcp::{BackendState, MetricsSnapshot};

use super::orchestrator::BackendPhase;

pub const LIST_SERVERS: &str = "gateway__list_servers";
pub const LIST_TOOLS: &str = "gateway__list_tools";
pub const RECONNECT: &str = "gateway__reconnect";
pub const STATUS: &str = "gateway__status";

pub const RESERVED_NAMES: [&str; 4] = [LIST_SERVERS, LIST_TOOLS, RECONNECT, STATUS];

/// Argument of [`RECONNECT`] naming the backend.
pub const SERVER_NAME_ARG: &str = "serverName";

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Declarations of the meta-operations, listed before any proxy.
pub fn declarations() -> Vec<Tool> {
    vec![
        Tool::new(
            LIST_SERVERS,
            "List all configured backend servers with their connection status",
            empty_schema(),
        ),
        Tool::new(
            LIST_TOOLS,
            "List all tools registered on the gateway with their owning server",
            empty_schema(),
        ),
        Tool::new(
            RECONNECT,
            "Reconnect to a backend server and register any new tools",
            object_schema(json!({
                "type": "object",
                "properties": {
                    SERVER_NAME_ARG: {
                        "type": "string",
                        "description": "Name of the server to reconnect"
                    }
                },
                "required": [SERVER_NAME_ARG]
            })),
        ),
        Tool::new(
            STATUS,
            "Gateway status: server and tool counts plus call metrics",
            empty_schema(),
        ),
    ]
}

fn empty_schema() -> Arc<Map<String, Value>> {
    object_schema(json!({ "type": "object", "properties": {} }))
}

fn object_schema(value: Value) -> Arc<Map<String, Value>> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(Map::new()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    /// `None` until the first connection attempt is recorded.
    pub status: Option<BackendState>,
    pub phase: BackendPhase,
    pub transport: &'static str,
    pub tool_count: usize,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub name: String,
    pub server: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectReport {
    pub server_name: String,
    pub phase: BackendPhase,
    pub status: Option<BackendState>,
    pub tool_count: usize,
    /// Proxies that did not exist before this reconnect.
    pub new_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub name: String,
    pub version: String,
    pub total_servers: usize,
    pub connected_servers: usize,
    pub total_tools: usize,
    pub use_namespace: bool,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        for name in RESERVED_NAMES {
            assert!(is_reserved(name));
        }
        assert!(!is_reserved("calc__add"));
        assert!(!is_reserved("status"));
    }

    #[test]
    fn test_declarations_cover_reserved_names() {
        let names: Vec<String> = declarations()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        assert_eq!(names, RESERVED_NAMES.to_vec());
    }

    #[test]
    fn test_reconnect_requires_server_name() {
        let tools = declarations();
        let reconnect = tools.iter().find(|tool| tool.name == RECONNECT).unwrap();
        assert_eq!(
            reconnect.input_schema.get("required"),
            Some(&json!(["serverName"]))
        );
    }
}
