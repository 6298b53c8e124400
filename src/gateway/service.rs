//! Upstream MCP server handler.

use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo,
    },
    service::RequestContext,
    ErrorData, RoleServer, ServerHandler,
};
use tracing::debug;

use super::orchestrator::Gateway;

/// Serves the gateway's meta-operations and proxies to one upstream peer.
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        let config = self.gateway.config();
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: config.name.clone(),
                version: config.version.clone(),
                ..Implementation::from_build_env()
            },
            instructions: Some(
                "Aggregates tools from several MCP servers. Use gateway__list_servers and \
                 gateway__status to inspect backends, gateway__reconnect to retry one."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(self.gateway.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        debug!(tool = %request.name, "Upstream tool call");
        self.gateway.call(&request.name, request.arguments).await
    }
}
