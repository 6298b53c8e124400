//! Gateway orchestration.
//!
//! The upstream endpoint is opened first; backends are brought up in the
//! background, each racing its own deadline. Proxies appear in the table as
//! backends become ready and are never removed.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rmcp::{
    model::{CallToolResult, Content, Tool},
    ErrorData, Peer, RoleServer,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use toolgate_mcp::{
    BackendConnection, BackendConnector, BackendDescriptor, BackendState, CapabilityDescriptor,
    ConnectOutcome, ConnectionRegistry, GatewayConfig, GatewayMetrics, McpError, McpResult,
    RefreshReason, RefreshRequest, RmcpConnector,
};
use tracing::{debug, error, info, warn};

use super::{
    meta::{self, ReconnectReport, ServerSummary, StatusReport, ToolSummary},
    proxy_table::{ProxyTable, RegisteredProxy, Registration},
};

const REFRESH_CHANNEL_CAPACITY: usize = 100;

/// How long shutdown waits for in-flight proxy calls.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Startup state machine of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendPhase {
    NotStarted,
    Disabled,
    Connecting,
    Ready,
    TimedOut,
    Failed,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    proxies: ProxyTable,
    phases: DashMap<String, BackendPhase>,
    metrics: Arc<GatewayMetrics>,

    /// Set once the upstream endpoint has completed its handshake.
    upstream: RwLock<Option<Peer<RoleServer>>>,

    refresh_tx: mpsc::Sender<RefreshRequest>,
    refresh_rx: Mutex<Option<mpsc::Receiver<RefreshRequest>>>,
    shutdown_token: CancellationToken,
}

impl Gateway {
    /// Gateway backed by real rmcp transports.
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        let connector = RmcpConnector::new().with_refresh_channel(refresh_tx.clone());
        Self::build(config, Arc::new(connector), refresh_tx, refresh_rx)
    }

    /// Gateway over a caller-supplied connector.
    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        Self::build(config, connector, refresh_tx, refresh_rx)
    }

    fn build(
        config: GatewayConfig,
        connector: Arc<dyn BackendConnector>,
        refresh_tx: mpsc::Sender<RefreshRequest>,
        refresh_rx: mpsc::Receiver<RefreshRequest>,
    ) -> Arc<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = ConnectionRegistry::new(connector)
            .with_metrics(Arc::clone(&metrics))
            .with_refresh_channel(refresh_tx.clone());

        let phases = config
            .servers
            .iter()
            .map(|server| (server.name.clone(), BackendPhase::NotStarted))
            .collect();

        Arc::new(Self {
            config,
            registry: Arc::new(registry),
            proxies: ProxyTable::new(),
            phases,
            metrics,
            upstream: RwLock::new(None),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn proxies(&self) -> &ProxyTable {
        &self.proxies
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Sender feeding the background refresh loop.
    pub fn refresh_sender(&self) -> mpsc::Sender<RefreshRequest> {
        self.refresh_tx.clone()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    pub fn phase(&self, backend: &str) -> Option<BackendPhase> {
        self.phases.get(backend).map(|phase| *phase)
    }

    pub fn descriptor(&self, backend: &str) -> Option<&BackendDescriptor> {
        self.config.servers.iter().find(|server| server.name == backend)
    }

    /// Name a proxy is exposed under.
    pub fn exposed_name(&self, capability: &CapabilityDescriptor) -> String {
        if self.config.use_namespace {
            capability.qualified_name.clone()
        } else {
            capability.local_name.clone()
        }
    }

    /// Record the upstream peer so proxy additions can be announced.
    pub fn attach_upstream(&self, peer: Peer<RoleServer>) {
        *self.upstream.write() = Some(peer);
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Start the refresh loop and bring up every backend concurrently.
    ///
    /// Returns at once. The handle completes when every backend has left
    /// the Connecting phase.
    pub fn start_background(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_refresh_handler();

        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.connect_all().await })
    }

    async fn connect_all(self: Arc<Self>) {
        let started = Instant::now();
        let tasks: Vec<_> = self
            .config
            .servers
            .iter()
            .cloned()
            .map(|descriptor| {
                let gateway = Arc::clone(&self);
                tokio::spawn(async move { gateway.bring_up(&descriptor).await })
            })
            .collect();

        let results = tokio::select! {
            results = futures::future::join_all(tasks) => results,
            _ = self.shutdown_token.cancelled() => {
                debug!("Shutdown requested during backend startup");
                return;
            }
        };

        let ready = results
            .iter()
            .filter(|phase| matches!(phase, Ok(BackendPhase::Ready)))
            .count();
        info!(
            ready,
            total = self.config.servers.len(),
            tools = self.proxies.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend startup finished"
        );
    }

    /// Run one backend through the startup state machine.
    pub async fn bring_up(&self, descriptor: &BackendDescriptor) -> BackendPhase {
        if descriptor.enabled {
            self.set_phase(&descriptor.name, BackendPhase::Connecting);
        }
        let outcome = self.registry.connect_with_deadline(descriptor).await;
        self.settle(descriptor, outcome).await
    }

    async fn settle(
        &self,
        descriptor: &BackendDescriptor,
        outcome: ConnectOutcome,
    ) -> BackendPhase {
        let phase = match outcome {
            ConnectOutcome::Disabled => {
                info!(backend = %descriptor.name, "Backend disabled");
                BackendPhase::Disabled
            }
            ConnectOutcome::Ready(connection) => {
                self.register_capabilities(&connection).await;
                BackendPhase::Ready
            }
            ConnectOutcome::TimedOut => {
                warn!(
                    backend = %descriptor.name,
                    timeout_ms = descriptor.connect_timeout().as_millis() as u64,
                    "Backend did not connect before its deadline"
                );
                BackendPhase::TimedOut
            }
            ConnectOutcome::Failed(message) => {
                error!(backend = %descriptor.name, error = %message, "Backend failed to connect");
                BackendPhase::Failed
            }
            ConnectOutcome::Superseded => {
                // The newer attempt owns the phase.
                debug!(backend = %descriptor.name, "Connection attempt superseded");
                return self
                    .phase(&descriptor.name)
                    .unwrap_or(BackendPhase::Connecting);
            }
        };
        self.set_phase(&descriptor.name, phase);
        phase
    }

    fn set_phase(&self, backend: &str, phase: BackendPhase) {
        self.phases.insert(backend.to_string(), phase);
    }

    /// Register a connection's capabilities as proxies. Returns how many
    /// names were new.
    pub async fn register_capabilities(&self, connection: &BackendConnection) -> usize {
        let added = connection
            .capabilities
            .iter()
            .map(|capability| {
                let exposed = self.exposed_name(capability);
                self.proxies
                    .register(RegisteredProxy::new(exposed, capability.clone()))
            })
            .filter(|outcome| *outcome == Registration::Added)
            .count();

        info!(
            backend = %connection.name(),
            tools = connection.capabilities.len(),
            added,
            "Registered backend tools"
        );
        if added > 0 {
            self.notify_tools_changed().await;
        }
        added
    }

    async fn notify_tools_changed(&self) {
        let peer = self.upstream.read().clone();
        let Some(peer) = peer else {
            return;
        };
        if let Err(e) = peer.notify_tool_list_changed().await {
            warn!(error = %e, "Failed to notify upstream of tool list change");
        }
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    fn spawn_refresh_handler(self: &Arc<Self>) {
        let Some(mut rx) = self.refresh_rx.lock().take() else {
            debug!("Refresh handler already running");
            return;
        };
        let token = self.shutdown_token.clone();
        let gateway = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Refresh handler shutting down");
                        break;
                    }
                    Some(request) = rx.recv() => gateway.handle_refresh(request).await,
                    else => break,
                }
            }
        });
    }

    /// Re-register a backend's proxies after its tool list changed or its
    /// session was replaced.
    pub async fn handle_refresh(&self, request: RefreshRequest) {
        debug!(backend = %request.backend, reason = ?request.reason, "Processing refresh request");

        let connection = match request.reason {
            RefreshReason::ToolListChanged => self.registry.refresh(&request.backend).await,
            RefreshReason::Reconnected => self
                .registry
                .get(&request.backend)
                .filter(|connection| connection.is_connected())
                .ok_or_else(|| McpError::NotConnected(request.backend.clone())),
        };

        match connection {
            Ok(connection) => {
                self.register_capabilities(&connection).await;
                self.set_phase(&request.backend, BackendPhase::Ready);
            }
            Err(e) => {
                warn!(backend = %request.backend, error = %e, "Failed to refresh backend tools");
            }
        }
    }

    // ========================================================================
    // Upstream surface
    // ========================================================================

    /// Meta-operations followed by every registered proxy.
    pub fn tools(&self) -> Vec<Tool> {
        let mut tools = meta::declarations();
        tools.extend(self.proxies.list().iter().map(|proxy| proxy.tool.clone()));
        tools
    }

    /// Dispatch an upstream call.
    ///
    /// Bad arguments and unknown names are protocol errors; backend
    /// failures come back as `isError` results.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, ErrorData> {
        match name {
            meta::LIST_SERVERS => return json_result(&self.list_servers()),
            meta::LIST_TOOLS => return json_result(&self.list_tools()),
            meta::STATUS => return json_result(&self.status()),
            meta::RECONNECT => return self.call_reconnect(arguments.as_ref()).await,
            _ => {}
        }

        let proxy = self
            .proxies
            .get(name)
            .ok_or_else(|| ErrorData::invalid_params(format!("tool not found: {}", name), None))?;
        let arguments = prepare_arguments(&proxy, arguments)?;

        let _guard = self.metrics.start_call();
        let capability = &proxy.capability;
        match self
            .registry
            .invoke(&capability.owning_backend, &capability.local_name, arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                self.metrics.record_call_failed();
                warn!(tool = %name, error = %e, "Proxy call failed");
                Ok(failure_result(capability, &e))
            }
        }
    }

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.config
            .servers
            .iter()
            .map(|descriptor| {
                let connection = self.registry.get(&descriptor.name);
                ServerSummary {
                    name: descriptor.name.clone(),
                    status: connection.as_ref().map(|c| c.state),
                    phase: self
                        .phase(&descriptor.name)
                        .unwrap_or(BackendPhase::NotStarted),
                    transport: descriptor.transport.kind(),
                    tool_count: connection.as_ref().map_or(0, |c| c.capabilities.len()),
                    tools: connection
                        .as_ref()
                        .map(|c| c.capability_names())
                        .unwrap_or_default(),
                    last_error: connection.as_ref().and_then(|c| c.last_error.clone()),
                    connected_at: connection.as_ref().and_then(|c| c.connected_at),
                }
            })
            .collect()
    }

    pub fn list_tools(&self) -> Vec<ToolSummary> {
        self.proxies
            .list()
            .iter()
            .map(|proxy| ToolSummary {
                name: proxy.exposed_name.clone(),
                server: proxy.capability.owning_backend.clone(),
                description: proxy.capability.description.clone(),
            })
            .collect()
    }

    pub fn status(&self) -> StatusReport {
        let connected_servers = self
            .registry
            .list()
            .iter()
            .filter(|connection| connection.state == BackendState::Connected)
            .count();

        StatusReport {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            total_servers: self.config.servers.len(),
            connected_servers,
            total_tools: self.proxies.len(),
            use_namespace: self.config.use_namespace,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Close the backend's live session and run it through startup again.
    pub async fn reconnect(&self, backend: &str) -> McpResult<ReconnectReport> {
        let descriptor = self
            .descriptor(backend)
            .cloned()
            .ok_or_else(|| McpError::BackendNotFound(backend.to_string()))?;
        let before: HashSet<String> = self.proxies.names().into_iter().collect();

        if descriptor.enabled {
            self.set_phase(backend, BackendPhase::Connecting);
        }
        let outcome = match self.registry.reconnect_with_deadline(backend).await {
            Ok(outcome) => outcome,
            Err(McpError::BackendNotFound(_)) => {
                self.registry.connect_with_deadline(&descriptor).await
            }
            Err(e) => return Err(e),
        };
        let phase = self.settle(&descriptor, outcome).await;

        let connection = self.registry.get(backend);
        let new_tools = self
            .proxies
            .names()
            .into_iter()
            .filter(|name| !before.contains(name))
            .collect();

        Ok(ReconnectReport {
            server_name: backend.to_string(),
            phase,
            status: connection.as_ref().map(|c| c.state),
            tool_count: connection.as_ref().map_or(0, |c| c.capabilities.len()),
            new_tools,
            last_error: connection.as_ref().and_then(|c| c.last_error.clone()),
        })
    }

    async fn call_reconnect(
        &self,
        arguments: Option<&Map<String, Value>>,
    ) -> Result<CallToolResult, ErrorData> {
        let backend = arguments
            .and_then(|args| args.get(meta::SERVER_NAME_ARG))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ErrorData::invalid_params(
                    format!("'{}' must be a string", meta::SERVER_NAME_ARG),
                    None,
                )
            })?;

        match self.reconnect(backend).await {
            Ok(report) => {
                let failed = matches!(report.phase, BackendPhase::TimedOut | BackendPhase::Failed);
                let text = to_pretty_json(&report)?;
                Ok(if failed {
                    CallToolResult::error(vec![Content::text(text)])
                } else {
                    CallToolResult::success(vec![Content::text(text)])
                })
            }
            Err(e) => {
                let body = json!({
                    "kind": e.kind(),
                    "backend": backend,
                    "message": e.to_string(),
                });
                let text = to_pretty_json(&body)?;
                Ok(CallToolResult::error(vec![Content::text(text)]))
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop background work, let in-flight calls finish, close every backend.
    pub async fn shutdown(&self) {
        info!("Starting graceful shutdown of gateway");
        self.shutdown_token.cancel();

        let start = Instant::now();
        while self.metrics.in_flight_calls() > 0 {
            if start.elapsed() >= SHUTDOWN_GRACE {
                warn!(
                    in_flight = self.metrics.in_flight_calls(),
                    "Shutdown grace period elapsed with calls still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.registry.disconnect_all().await;
        *self.upstream.write() = None;
        info!("Gateway shutdown complete");
    }
}

/// Coerce then validate call arguments against the proxy's schema.
fn prepare_arguments(
    proxy: &RegisteredProxy,
    arguments: Option<Map<String, Value>>,
) -> Result<Option<Map<String, Value>>, ErrorData> {
    let mut value = Value::Object(arguments.unwrap_or_default());
    proxy.schema.coerce(&mut value);
    proxy.schema.validate(&value).map_err(|violation| {
        ErrorData::invalid_params(
            format!("invalid arguments for {}: {}", proxy.exposed_name, violation),
            None,
        )
    })?;

    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

fn failure_result(capability: &CapabilityDescriptor, error: &McpError) -> CallToolResult {
    let body = json!({
        "kind": error.kind(),
        "backend": capability.owning_backend,
        "capability": capability.local_name,
        "message": error.to_string(),
    });
    let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| error.to_string());
    CallToolResult::error(vec![Content::text(text)])
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, ErrorData> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ErrorData::internal_error(format!("serialize response: {}", e), None))
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = to_pretty_json(value)?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}
