//! Backend sessions and the connector that opens them.
//!
//! [`BackendConnector`] turns a descriptor into a live [`BackendSession`]:
//! transport opened and MCP handshake done. The registry only talks to these
//! traits, so tests can substitute in-process backends.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, ConfigureCommandExt, IntoTransport, SseClientTransport,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    Peer, RoleClient, ServiceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    config::{BackendDescriptor, BackendTransport},
    handler::{GatewayClientHandler, RefreshRequest},
};
use crate::error::{McpError, McpResult};

/// A connected backend, as seen by the registry.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Full capability list, following pagination.
    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn call_tool(&self, request: CallToolRequestParam) -> McpResult<CallToolResult>;

    /// Close the session. Calling it twice is harmless.
    async fn close(&self) -> McpResult<()>;
}

/// Opens transports and performs the session handshake.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn open(&self, descriptor: &BackendDescriptor) -> McpResult<Arc<dyn BackendSession>>;
}

type BackendClient = RunningService<RoleClient, GatewayClientHandler>;

/// Session backed by an rmcp client service.
pub struct RmcpSession {
    backend: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<BackendClient>>,
}

impl RmcpSession {
    /// Run the MCP handshake over any rmcp transport.
    pub async fn handshake<T, E, A>(
        backend: &str,
        handler: GatewayClientHandler,
        transport: T,
    ) -> McpResult<Self>
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let service = handler.serve(transport).await.map_err(|e| McpError::Connect {
            backend: backend.to_string(),
            message: format!("initialize client: {}", e),
        })?;
        Ok(Self::from_running(backend, service))
    }

    pub fn from_running(backend: &str, service: BackendClient) -> Self {
        Self {
            backend: backend.to_string(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl BackendSession for RmcpSession {
    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.peer.list_all_tools().await.map_err(McpError::from)
    }

    async fn call_tool(&self, request: CallToolRequestParam) -> McpResult<CallToolResult> {
        self.peer.call_tool(request).await.map_err(McpError::from)
    }

    async fn close(&self) -> McpResult<()> {
        let service = self.service.lock().take();
        let Some(service) = service else {
            return Ok(());
        };
        let reason = service
            .cancel()
            .await
            .map_err(|e| McpError::Transport(format!("close session: {}", e)))?;
        debug!(backend = %self.backend, reason = ?reason, "Backend session closed");
        Ok(())
    }
}

/// Production connector: child processes, SSE and streamable HTTP.
#[derive(Default, Clone)]
pub struct RmcpConnector {
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl RmcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward backend tool-list notifications to `tx`.
    #[must_use]
    pub fn with_refresh_channel(mut self, tx: mpsc::Sender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    fn handler_for(&self, backend: &str) -> GatewayClientHandler {
        let handler = GatewayClientHandler::new(backend);
        match &self.refresh_tx {
            Some(tx) => handler.with_refresh_channel(tx.clone()),
            None => handler,
        }
    }
}

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn open(&self, descriptor: &BackendDescriptor) -> McpResult<Arc<dyn BackendSession>> {
        let name = descriptor.name.as_str();
        let handler = self.handler_for(name);

        info!(backend = %name, transport = ?descriptor.transport, "Connecting to backend");

        let session = match &descriptor.transport {
            BackendTransport::Stdio { command, args, env } => {
                if command.is_empty() {
                    return Err(connect_error(name, "stdio transport requires 'command'"));
                }
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| connect_error(name, format!("spawn '{}': {}", command, e)))?;

                RmcpSession::handshake(name, handler, transport).await?
            }

            BackendTransport::Http { url } => {
                let url = parse_url(name, url)?;
                let client = build_http_client(name)?;
                let config = SseClientConfig {
                    sse_endpoint: url.to_string().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(client, config)
                    .await
                    .map_err(|e| connect_error(name, format!("open SSE stream: {}", e)))?;

                RmcpSession::handshake(name, handler, transport).await?
            }

            BackendTransport::Streamable { url } => {
                let url = parse_url(name, url)?;
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                RmcpSession::handshake(name, handler, transport).await?
            }
        };

        info!(backend = %name, "Backend handshake complete");
        Ok(Arc::new(session))
    }
}

fn connect_error(backend: &str, message: impl Into<String>) -> McpError {
    McpError::Connect {
        backend: backend.to_string(),
        message: message.into(),
    }
}

fn parse_url(backend: &str, raw: &str) -> McpResult<url::Url> {
    if raw.is_empty() {
        return Err(connect_error(backend, "http transport requires 'url'"));
    }
    let url = url::Url::parse(raw)
        .map_err(|e| connect_error(backend, format!("invalid URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(connect_error(
            backend,
            format!("unsupported URL scheme '{}'", url.scheme()),
        ));
    }
    Ok(url)
}

fn build_http_client(backend: &str) -> McpResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| connect_error(backend, format!("build HTTP client: {}", e)))
}
