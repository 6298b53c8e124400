//! toolgate: one MCP endpoint in front of many MCP servers.
//!
//! The upstream endpoint is served immediately; backends connect in the
//! background and their tools appear as `<backend>__<tool>` proxies.

pub mod gateway;
pub mod logging;

pub use gateway::{BackendPhase, Gateway, GatewayService};
pub use toolgate_mcp::{BackendDescriptor, GatewayConfig, McpError, McpResult};
