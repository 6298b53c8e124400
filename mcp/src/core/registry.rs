//! Connection registry: one record per configured backend.
//!
//! Records are immutable and replaced wholesale on every state change. Each
//! connection attempt carries an id; a result only lands in the store if its
//! attempt is still the current one for that backend, so a slow attempt that
//! lost a deadline race can never overwrite newer state.

use std::{
    borrow::Cow,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    config::BackendDescriptor,
    handler::{RefreshReason, RefreshRequest},
    metrics::GatewayMetrics,
    session::{BackendConnector, BackendSession},
};
use crate::error::{McpError, McpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Disabled,
    Connecting,
    Connected,
    Failed,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Disabled => "disabled",
            BackendState::Connecting => "connecting",
            BackendState::Connected => "connected",
            BackendState::Failed => "failed",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capability as discovered on a backend.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub local_name: String,
    pub qualified_name: String,
    pub description: String,
    /// Input schema exactly as the backend declared it.
    pub parameter_schema: Arc<Map<String, Value>>,
    pub owning_backend: String,
}

impl CapabilityDescriptor {
    pub fn from_tool(descriptor: &BackendDescriptor, tool: &Tool) -> Self {
        Self {
            local_name: tool.name.to_string(),
            qualified_name: descriptor.qualify(&tool.name),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            parameter_schema: Arc::clone(&tool.input_schema),
            owning_backend: descriptor.name.clone(),
        }
    }
}

/// Snapshot of a backend's connection.
///
/// `session` is set if and only if `state` is [`BackendState::Connected`].
#[derive(Clone)]
pub struct BackendConnection {
    pub descriptor: BackendDescriptor,
    session: Option<Arc<dyn BackendSession>>,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub state: BackendState,
    pub last_error: Option<String>,
    pub attempt: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

impl BackendConnection {
    pub fn disabled(descriptor: BackendDescriptor) -> Self {
        Self::without_session(descriptor, BackendState::Disabled, None, 0)
    }

    pub fn connecting(descriptor: BackendDescriptor, attempt: u64) -> Self {
        Self::without_session(descriptor, BackendState::Connecting, None, attempt)
    }

    pub fn failed(descriptor: BackendDescriptor, error: impl Into<String>, attempt: u64) -> Self {
        Self::without_session(descriptor, BackendState::Failed, Some(error.into()), attempt)
    }

    pub fn connected(
        descriptor: BackendDescriptor,
        session: Arc<dyn BackendSession>,
        capabilities: Vec<CapabilityDescriptor>,
        attempt: u64,
    ) -> Self {
        Self {
            descriptor,
            session: Some(session),
            capabilities,
            state: BackendState::Connected,
            last_error: None,
            attempt,
            connected_at: Some(Utc::now()),
        }
    }

    fn without_session(
        descriptor: BackendDescriptor,
        state: BackendState,
        last_error: Option<String>,
        attempt: u64,
    ) -> Self {
        Self {
            descriptor,
            session: None,
            capabilities: Vec::new(),
            state,
            last_error,
            attempt,
            connected_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_connected(&self) -> bool {
        self.state == BackendState::Connected && self.session.is_some()
    }

    pub fn session(&self) -> Option<&Arc<dyn BackendSession>> {
        self.session.as_ref()
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|cap| cap.local_name.clone())
            .collect()
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities.len())
            .field("has_session", &self.session.is_some())
            .field("last_error", &self.last_error)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Result of a connect attempt raced against its deadline.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Disabled,
    Ready(Arc<BackendConnection>),
    TimedOut,
    Failed(String),
    /// A newer attempt for the same backend replaced this one.
    Superseded,
}

pub struct ConnectionRegistry {
    connector: Arc<dyn BackendConnector>,
    connections: DashMap<String, Arc<BackendConnection>>,
    next_attempt: AtomicU64,
    metrics: Arc<GatewayMetrics>,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
            next_attempt: AtomicU64::new(1),
            metrics: Arc::new(GatewayMetrics::new()),
            refresh_tx: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Post a refresh request after every successful automatic reconnect.
    #[must_use]
    pub fn with_refresh_channel(mut self, tx: mpsc::Sender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.connections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All records, ordered by backend name.
    pub fn list(&self) -> Vec<Arc<BackendConnection>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Open, handshake and discover. Failure is returned as a Failed record.
    pub async fn connect(&self, descriptor: &BackendDescriptor) -> Arc<BackendConnection> {
        if !descriptor.enabled {
            return self.mark_disabled(descriptor).await;
        }

        let attempt = self.begin_attempt(descriptor).await;
        match self.establish(descriptor, attempt).await {
            Some(connection) => connection,
            None => self.get(&descriptor.name).unwrap_or_else(|| {
                Arc::new(BackendConnection::failed(
                    descriptor.clone(),
                    "connection attempt superseded",
                    attempt,
                ))
            }),
        }
    }

    /// Race [`Self::connect`] against the descriptor's deadline.
    ///
    /// A timed-out attempt keeps running; if it succeeds later its session is
    /// closed on arrival.
    pub async fn connect_with_deadline(
        self: &Arc<Self>,
        descriptor: &BackendDescriptor,
    ) -> ConnectOutcome {
        if !descriptor.enabled {
            self.mark_disabled(descriptor).await;
            return ConnectOutcome::Disabled;
        }

        let attempt = self.begin_attempt(descriptor).await;
        let deadline = descriptor.connect_timeout();

        let registry = Arc::clone(self);
        let task_descriptor = descriptor.clone();
        let task =
            tokio::spawn(async move { registry.establish(&task_descriptor, attempt).await });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(Some(connection))) if connection.is_connected() => {
                ConnectOutcome::Ready(connection)
            }
            Ok(Ok(Some(connection))) => ConnectOutcome::Failed(
                connection
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "connection failed".to_string()),
            ),
            Ok(Ok(None)) => ConnectOutcome::Superseded,
            Ok(Err(join_error)) => {
                let message = format!("connect task failed: {}", join_error);
                self.expire_attempt(descriptor, attempt, message.clone());
                ConnectOutcome::Failed(message)
            }
            Err(_) => {
                let message = format!("connection timed out after {} ms", deadline.as_millis());
                warn!(backend = %descriptor.name, "{}", message);
                self.metrics.record_connection_error();
                self.expire_attempt(descriptor, attempt, message);
                ConnectOutcome::TimedOut
            }
        }
    }

    /// Store a Connecting record under a fresh attempt id, closing whatever
    /// session the previous record held.
    pub async fn begin_attempt(&self, descriptor: &BackendDescriptor) -> u64 {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(BackendConnection::connecting(descriptor.clone(), attempt));
        if let Some(previous) = self.connections.insert(descriptor.name.clone(), record) {
            self.close_session(&previous).await;
        }
        debug!(backend = %descriptor.name, attempt, "Connection attempt started");
        attempt
    }

    /// Run one attempt to completion. Returns `None` if the attempt was
    /// superseded before it finished; any session it opened is closed.
    pub async fn establish(
        &self,
        descriptor: &BackendDescriptor,
        attempt: u64,
    ) -> Option<Arc<BackendConnection>> {
        let record = match self.open_and_discover(descriptor).await {
            Ok((session, capabilities)) => {
                BackendConnection::connected(descriptor.clone(), session, capabilities, attempt)
            }
            Err(e) => {
                warn!(backend = %descriptor.name, error = %e, "Backend connection failed");
                self.metrics.record_connection_error();
                BackendConnection::failed(descriptor.clone(), e.to_string(), attempt)
            }
        };

        match self.commit(record) {
            Ok(connection) => {
                if connection.is_connected() {
                    self.metrics.record_connection_opened();
                    info!(
                        backend = %descriptor.name,
                        tools = connection.capabilities.len(),
                        "Backend connected"
                    );
                }
                Some(connection)
            }
            Err(stale) => {
                debug!(
                    backend = %descriptor.name,
                    attempt,
                    "Discarding result of superseded connection attempt"
                );
                self.close_session(&stale).await;
                None
            }
        }
    }

    /// Mark `attempt` as failed if it is still current. The Failed record gets
    /// a new attempt id so the still-running attempt can no longer commit.
    pub fn expire_attempt(
        &self,
        descriptor: &BackendDescriptor,
        attempt: u64,
        message: impl Into<String>,
    ) -> bool {
        let Some(mut slot) = self.connections.get_mut(&descriptor.name) else {
            return false;
        };
        if slot.attempt != attempt {
            return false;
        }
        let next = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        *slot = Arc::new(BackendConnection::failed(descriptor.clone(), message, next));
        true
    }

    /// Query a session's capability list.
    pub async fn discover(
        &self,
        descriptor: &BackendDescriptor,
        session: &dyn BackendSession,
    ) -> McpResult<Vec<CapabilityDescriptor>> {
        let tools = session
            .list_tools()
            .await
            .map_err(|e| McpError::Discovery {
                backend: descriptor.name.clone(),
                message: e.to_string(),
            })?;

        debug!(backend = %descriptor.name, count = tools.len(), "Discovered tools");
        Ok(tools
            .iter()
            .map(|tool| CapabilityDescriptor::from_tool(descriptor, tool))
            .collect())
    }

    /// Forward a call to `backend`.
    ///
    /// A transport failure demotes the backend to Failed and, unless
    /// `autoReconnect` is off, makes one reconnect attempt bounded by the
    /// connect deadline. The current call still reports the original failure.
    pub async fn invoke(
        self: &Arc<Self>,
        backend: &str,
        capability: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let connection = self
            .get(backend)
            .filter(|connection| connection.is_connected())
            .ok_or_else(|| McpError::NotConnected(backend.to_string()))?;
        let session = connection
            .session()
            .cloned()
            .ok_or_else(|| McpError::NotConnected(backend.to_string()))?;

        let request = CallToolRequestParam {
            name: Cow::Owned(capability.to_string()),
            arguments,
        };

        let error = match session.call_tool(request).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if error.is_transport() {
            warn!(backend, capability, error = %error, "Backend call failed at transport level");
            if self.demote(&connection, &error).await && connection.descriptor.auto_reconnect {
                self.reconnect_after_failure(&connection.descriptor).await;
            }
        } else {
            debug!(backend, capability, error = %error, "Backend reported call error");
        }

        Err(McpError::Invocation {
            backend: backend.to_string(),
            capability: capability.to_string(),
            message: error.to_string(),
        })
    }

    /// Close any live session for `backend`, then connect again.
    pub async fn reconnect(&self, backend: &str) -> McpResult<Arc<BackendConnection>> {
        let descriptor = self.descriptor_of(backend)?;
        info!(backend, "Reconnecting backend");
        Ok(self.connect(&descriptor).await)
    }

    /// [`Self::reconnect`] with the connect deadline applied.
    pub async fn reconnect_with_deadline(
        self: &Arc<Self>,
        backend: &str,
    ) -> McpResult<ConnectOutcome> {
        let descriptor = self.descriptor_of(backend)?;
        info!(backend, "Reconnecting backend");
        Ok(self.connect_with_deadline(&descriptor).await)
    }

    /// Re-read the capability list of a connected backend, keeping its session.
    pub async fn refresh(&self, backend: &str) -> McpResult<Arc<BackendConnection>> {
        let connection = self
            .get(backend)
            .filter(|connection| connection.is_connected())
            .ok_or_else(|| McpError::NotConnected(backend.to_string()))?;
        let session = connection
            .session()
            .cloned()
            .ok_or_else(|| McpError::NotConnected(backend.to_string()))?;

        let capabilities = self
            .discover(&connection.descriptor, session.as_ref())
            .await?;

        let mut updated = (*connection).clone();
        updated.capabilities = capabilities;
        // A call may have demoted the record under the same attempt meanwhile.
        self.commit_when(updated, BackendConnection::is_connected)
            .map_err(|_| McpError::NotConnected(backend.to_string()))
    }

    /// Close every live session and clear the store. Close failures are logged.
    pub async fn disconnect_all(&self) {
        let all: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();

        for connection in all {
            self.close_session(&connection).await;
        }
        info!("All backend connections closed");
    }

    async fn mark_disabled(&self, descriptor: &BackendDescriptor) -> Arc<BackendConnection> {
        debug!(backend = %descriptor.name, "Backend disabled, skipping connection");
        let record = Arc::new(BackendConnection::disabled(descriptor.clone()));
        if let Some(previous) = self
            .connections
            .insert(descriptor.name.clone(), Arc::clone(&record))
        {
            self.close_session(&previous).await;
        }
        record
    }

    async fn open_and_discover(
        &self,
        descriptor: &BackendDescriptor,
    ) -> McpResult<(Arc<dyn BackendSession>, Vec<CapabilityDescriptor>)> {
        let session = self.connector.open(descriptor).await?;
        match self.discover(descriptor, session.as_ref()).await {
            Ok(capabilities) => Ok((session, capabilities)),
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    debug!(
                        backend = %descriptor.name,
                        error = %close_error,
                        "Close after failed discovery"
                    );
                }
                Err(e)
            }
        }
    }

    /// Store `record` if its attempt is still current; hand it back otherwise.
    fn commit(
        &self,
        record: BackendConnection,
    ) -> Result<Arc<BackendConnection>, BackendConnection> {
        self.commit_when(record, |_| true)
    }

    /// [`Self::commit`], additionally requiring `accept` to hold for the
    /// record currently stored.
    fn commit_when(
        &self,
        record: BackendConnection,
        accept: impl FnOnce(&BackendConnection) -> bool,
    ) -> Result<Arc<BackendConnection>, BackendConnection> {
        let Some(mut slot) = self.connections.get_mut(&record.descriptor.name) else {
            return Err(record);
        };
        if slot.attempt != record.attempt || !accept(&**slot) {
            return Err(record);
        }
        let record = Arc::new(record);
        *slot = Arc::clone(&record);
        Ok(record)
    }

    /// Replace a connected record with a Failed one and close its session.
    /// Returns false if the record was already replaced by someone else.
    async fn demote(&self, connection: &BackendConnection, error: &McpError) -> bool {
        let mut failed = BackendConnection::failed(
            connection.descriptor.clone(),
            error.to_string(),
            connection.attempt,
        );
        failed.capabilities = connection.capabilities.clone();

        if self.commit(failed).is_err() {
            return false;
        }
        self.close_session(connection).await;
        true
    }

    async fn reconnect_after_failure(self: &Arc<Self>, descriptor: &BackendDescriptor) {
        self.metrics.record_reconnect_attempt();
        info!(backend = %descriptor.name, "Attempting automatic reconnect");

        match self.connect_with_deadline(descriptor).await {
            ConnectOutcome::Ready(_) => {}
            outcome => {
                warn!(backend = %descriptor.name, outcome = ?outcome, "Automatic reconnect failed");
                return;
            }
        }

        info!(backend = %descriptor.name, "Automatic reconnect succeeded");
        if let Some(tx) = &self.refresh_tx {
            let request = RefreshRequest {
                backend: descriptor.name.clone(),
                reason: RefreshReason::Reconnected,
            };
            if let Err(e) = tx.try_send(request) {
                warn!(backend = %descriptor.name, error = %e, "Failed to send refresh request");
            }
        }
    }

    async fn close_session(&self, connection: &BackendConnection) {
        let Some(session) = connection.session() else {
            return;
        };
        if let Err(e) = session.close().await {
            warn!(backend = %connection.name(), error = %e, "Error closing backend session");
        }
        self.metrics.record_connection_closed();
    }

    fn descriptor_of(&self, backend: &str) -> McpResult<BackendDescriptor> {
        self.get(backend)
            .map(|connection| connection.descriptor.clone())
            .ok_or_else(|| McpError::BackendNotFound(backend.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rmcp::model::Content;
    use serde_json::json;

    use super::*;

    fn tool(name: &str) -> Tool {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "number" } }
        });
        let schema = match schema {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        Tool::new(name.to_string(), format!("{} tool", name), Arc::new(schema))
    }

    #[derive(Default)]
    struct StubSession {
        tools: Vec<Tool>,
        fail_next_call: AtomicBool,
        remote_error: AtomicBool,
        fail_discovery: bool,
        list_delay_ms: AtomicU64,
        closed: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendSession for StubSession {
        async fn list_tools(&self) -> McpResult<Vec<Tool>> {
            let delay = self.list_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_discovery {
                return Err(McpError::Transport("list failed".to_string()));
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, request: CallToolRequestParam) -> McpResult<CallToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::Transport("session closed".to_string()));
            }
            if self.fail_next_call.swap(false, Ordering::SeqCst) {
                return Err(McpError::Transport("broken pipe".to_string()));
            }
            if self.remote_error.load(Ordering::SeqCst) {
                return Err(McpError::Remote("unknown tool".to_string()));
            }
            Ok(CallToolResult::success(vec![Content::text(format!(
                "called {}",
                request.name
            ))]))
        }

        async fn close(&self) -> McpResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubConnector {
        tools: Vec<&'static str>,
        delay: Option<Duration>,
        fail_open: AtomicBool,
        fail_discovery: bool,
        /// Opens after this many never complete.
        hang_after: Option<usize>,
        open_calls: AtomicUsize,
        opened: Mutex<Vec<Arc<StubSession>>>,
    }

    impl StubConnector {
        fn with_tools(tools: &[&'static str]) -> Self {
            Self {
                tools: tools.to_vec(),
                ..Default::default()
            }
        }

        fn opens(&self) -> usize {
            self.opened.lock().len()
        }

        fn session(&self, index: usize) -> Arc<StubSession> {
            Arc::clone(&self.opened.lock()[index])
        }
    }

    #[async_trait]
    impl BackendConnector for StubConnector {
        async fn open(&self, descriptor: &BackendDescriptor) -> McpResult<Arc<dyn BackendSession>> {
            let index = self.open_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_after.is_some_and(|limit| index >= limit) {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(McpError::Connect {
                    backend: descriptor.name.clone(),
                    message: "connection refused".to_string(),
                });
            }
            let session = Arc::new(StubSession {
                tools: self.tools.iter().map(|name| tool(name)).collect(),
                fail_discovery: self.fail_discovery,
                ..Default::default()
            });
            self.opened.lock().push(Arc::clone(&session));
            let session: Arc<dyn BackendSession> = session;
            Ok(session)
        }
    }

    struct PanickingConnector;

    #[async_trait]
    impl BackendConnector for PanickingConnector {
        async fn open(&self, descriptor: &BackendDescriptor) -> McpResult<Arc<dyn BackendSession>> {
            panic!("disabled backend '{}' must not be opened", descriptor.name);
        }
    }

    fn registry(connector: &Arc<StubConnector>) -> Arc<ConnectionRegistry> {
        let connector: Arc<dyn BackendConnector> = connector.clone();
        Arc::new(ConnectionRegistry::new(connector))
    }

    #[tokio::test]
    async fn test_disabled_backend_does_no_io() {
        let registry = ConnectionRegistry::new(Arc::new(PanickingConnector));
        let descriptor = BackendDescriptor::stdio("calc", "calc-tool").disabled();

        let connection = registry.connect(&descriptor).await;
        assert_eq!(connection.state, BackendState::Disabled);
        assert!(connection.capabilities.is_empty());
        assert!(connection.session().is_none());
    }

    #[tokio::test]
    async fn test_connect_discovers_qualified_capabilities() {
        let connector = Arc::new(StubConnector::with_tools(&["add", "multiply"]));
        let registry = registry(&connector);

        let connection = registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;

        assert_eq!(connection.state, BackendState::Connected);
        assert!(connection.connected_at.is_some());
        let names: Vec<_> = connection
            .capabilities
            .iter()
            .map(|cap| cap.qualified_name.as_str())
            .collect();
        assert_eq!(names, vec!["calc__add", "calc__multiply"]);
        assert_eq!(connection.capabilities[0].owning_backend, "calc");
        assert_eq!(connection.capabilities[0].description, "add tool");
        assert_eq!(registry.metrics().snapshot().connections_opened, 1);
    }

    #[tokio::test]
    async fn test_empty_capability_list_is_valid() {
        let connector = Arc::new(StubConnector::default());
        let registry = registry(&connector);

        let connection = registry
            .connect(&BackendDescriptor::stdio("empty", "empty-tool"))
            .await;
        assert_eq!(connection.state, BackendState::Connected);
        assert!(connection.capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let connector = Arc::new(StubConnector::default());
        connector.fail_open.store(true, Ordering::SeqCst);
        let registry = registry(&connector);

        let connection = registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;

        assert_eq!(connection.state, BackendState::Failed);
        assert!(connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("connection refused")));
        assert_eq!(
            registry.get("calc").map(|c| c.state),
            Some(BackendState::Failed)
        );
    }

    #[tokio::test]
    async fn test_discovery_failure_closes_session() {
        let connector = Arc::new(StubConnector {
            fail_discovery: true,
            ..Default::default()
        });
        let registry = registry(&connector);

        let connection = registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;

        assert_eq!(connection.state, BackendState::Failed);
        assert!(connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("tool discovery failed")));
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invoke_unknown_or_failed_is_not_connected() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        connector.fail_open.store(true, Ordering::SeqCst);
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;

        let err = registry.invoke("calc", "add", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected(ref name) if name == "calc"));

        let err = registry.invoke("nope", "add", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_demotes_and_reconnects_once() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let (tx, mut rx) = mpsc::channel(4);
        let registry = Arc::new(
            ConnectionRegistry::new(connector.clone() as Arc<dyn BackendConnector>)
                .with_refresh_channel(tx),
        );
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;
        connector.session(0).fail_next_call.store(true, Ordering::SeqCst);

        let err = registry.invoke("calc", "add", None).await.unwrap_err();
        match err {
            McpError::Invocation {
                backend,
                capability,
                message,
            } => {
                assert_eq!(backend, "calc");
                assert_eq!(capability, "add");
                assert!(message.contains("broken pipe"));
            }
            other => panic!("expected invocation error, got {:?}", other),
        }

        assert_eq!(connector.opens(), 2);
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert_eq!(
            registry.get("calc").map(|c| c.state),
            Some(BackendState::Connected)
        );
        assert_eq!(registry.metrics().snapshot().reconnect_attempts, 1);

        let request = rx.recv().await.unwrap();
        assert_eq!(request.backend, "calc");
        assert_eq!(request.reason, RefreshReason::Reconnected);

        let result = registry.invoke("calc", "add", None).await.unwrap();
        assert_ne!(result.is_error, Some(true));
        assert_eq!(connector.session(1).calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_without_auto_reconnect_stays_failed() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool").with_auto_reconnect(false))
            .await;
        connector.session(0).fail_next_call.store(true, Ordering::SeqCst);

        assert!(registry.invoke("calc", "add", None).await.is_err());
        assert_eq!(connector.opens(), 1);

        let connection = registry.get("calc").unwrap();
        assert_eq!(connection.state, BackendState::Failed);
        assert_eq!(connection.capabilities.len(), 1);

        let err = registry.invoke("calc", "add", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_hanging_auto_reconnect_is_bounded_by_deadline() {
        let connector = Arc::new(StubConnector {
            tools: vec!["add"],
            hang_after: Some(1),
            ..Default::default()
        });
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool").with_timeout_ms(100))
            .await;
        connector.session(0).fail_next_call.store(true, Ordering::SeqCst);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            registry.invoke("calc", "add", None),
        )
        .await
        .expect("invoke must return once the reconnect deadline passes");
        assert!(matches!(result, Err(McpError::Invocation { .. })));

        let connection = registry.get("calc").unwrap();
        assert_eq!(connection.state, BackendState::Failed);
        assert!(connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));
        assert_eq!(connector.open_calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.metrics().snapshot().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_connection() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;
        connector.session(0).remote_error.store(true, Ordering::SeqCst);

        let err = registry.invoke("calc", "add", None).await.unwrap_err();
        assert!(matches!(err, McpError::Invocation { .. }));
        assert_eq!(connector.opens(), 1);
        assert_eq!(
            registry.get("calc").map(|c| c.state),
            Some(BackendState::Connected)
        );
    }

    #[tokio::test]
    async fn test_deadline_expires_and_late_session_is_closed() {
        let connector = Arc::new(StubConnector {
            tools: vec!["add"],
            delay: Some(Duration::from_millis(150)),
            ..Default::default()
        });
        let registry = registry(&connector);
        let descriptor = BackendDescriptor::stdio("slow", "slow-tool").with_timeout_ms(30);

        let outcome = registry.connect_with_deadline(&descriptor).await;
        assert!(matches!(outcome, ConnectOutcome::TimedOut));

        let connection = registry.get("slow").unwrap();
        assert_eq!(connection.state, BackendState::Failed);
        assert!(connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(connector.opens(), 1);
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert_eq!(
            registry.get("slow").map(|c| c.state),
            Some(BackendState::Failed)
        );
    }

    #[tokio::test]
    async fn test_reconnect_twice_stays_connected() {
        let connector = Arc::new(StubConnector::with_tools(&["add", "subtract"]));
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool"))
            .await;

        let first = registry.reconnect("calc").await.unwrap();
        let second = registry.reconnect("calc").await.unwrap();

        assert_eq!(first.state, BackendState::Connected);
        assert_eq!(second.state, BackendState::Connected);
        assert_eq!(second.capabilities.len(), 2);
        assert_eq!(connector.opens(), 3);
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert!(connector.session(1).closed.load(Ordering::SeqCst));
        assert!(!connector.session(2).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reconnect_unknown_backend() {
        let connector = Arc::new(StubConnector::default());
        let registry = registry(&connector);

        let err = registry.reconnect("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_and_clears() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("a", "a-tool"))
            .await;
        registry
            .connect(&BackendDescriptor::stdio("b", "b-tool"))
            .await;

        registry.disconnect_all().await;

        assert!(registry.is_empty());
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert!(connector.session(1).closed.load(Ordering::SeqCst));
        assert_eq!(registry.metrics().snapshot().connections_closed, 2);
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_commit() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        let descriptor = BackendDescriptor::stdio("calc", "calc-tool");

        let stale = registry.begin_attempt(&descriptor).await;
        let current = registry.begin_attempt(&descriptor).await;
        assert!(current > stale);

        assert!(registry.establish(&descriptor, stale).await.is_none());
        assert!(connector.session(0).closed.load(Ordering::SeqCst));
        assert_eq!(
            registry.get("calc").map(|c| c.state),
            Some(BackendState::Connecting)
        );

        let connection = registry.establish(&descriptor, current).await.unwrap();
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_refresh_rediscovers_on_live_session() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        let descriptor = BackendDescriptor::stdio("calc", "calc-tool");
        let before = registry.connect(&descriptor).await;

        let after = registry.refresh("calc").await.unwrap();
        assert_eq!(after.attempt, before.attempt);
        assert_eq!(after.capabilities.len(), 1);
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn test_refresh_does_not_revive_demoted_backend() {
        let connector = Arc::new(StubConnector::with_tools(&["add"]));
        let registry = registry(&connector);
        registry
            .connect(&BackendDescriptor::stdio("calc", "calc-tool").with_auto_reconnect(false))
            .await;
        let session = connector.session(0);
        session.list_delay_ms.store(200, Ordering::SeqCst);

        let refreshing = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.refresh("calc").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.fail_next_call.store(true, Ordering::SeqCst);
        assert!(registry.invoke("calc", "add", None).await.is_err());
        assert_eq!(
            registry.get("calc").map(|c| c.state),
            Some(BackendState::Failed)
        );

        let refreshed = refreshing.await.unwrap();
        assert!(matches!(refreshed, Err(McpError::NotConnected(_))));

        let connection = registry.get("calc").unwrap();
        assert_eq!(connection.state, BackendState::Failed);
        assert!(connection.session().is_none());
        assert!(session.closed.load(Ordering::SeqCst));
    }
}
