//! Client handler for notifications coming from backend servers.
//!
//! Implements rmcp's `ClientHandler` so a backend can tell the gateway its
//! tool list changed, report progress, or forward log messages.

use std::sync::Arc;

use rmcp::{
    model::{
        CancelledNotificationParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ProgressNotificationParam,
    },
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Why a backend's capabilities should be re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The backend announced a changed tool list.
    ToolListChanged,
    /// The registry replaced the session after a failed call.
    Reconnected,
}

/// Request to refresh a backend's registered proxies.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub backend: String,
    pub reason: RefreshReason,
}

#[derive(Clone)]
pub struct GatewayClientHandler {
    backend: Arc<str>,
    client_info: ClientInfo,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl GatewayClientHandler {
    pub fn new(backend: impl AsRef<str>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = format!("gateway-client-{}", backend.as_ref());
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            backend: Arc::from(backend.as_ref()),
            client_info,
            refresh_tx: None,
        }
    }

    #[must_use]
    pub fn with_refresh_channel(mut self, tx: mpsc::Sender<RefreshRequest>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn send_refresh(&self) {
        let Some(tx) = &self.refresh_tx else {
            return;
        };
        let request = RefreshRequest {
            backend: self.backend.to_string(),
            reason: RefreshReason::ToolListChanged,
        };
        if let Err(e) = tx.try_send(request) {
            warn!(backend = %self.backend, error = %e, "Failed to send refresh request");
        }
    }
}

impl ClientHandler for GatewayClientHandler {
    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            backend = %self.backend,
            request_id = %params.request_id,
            reason = ?params.reason,
            "Backend cancelled request"
        );
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            backend = %self.backend,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            "Backend progress"
        );
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(backend = %self.backend, "Backend tool list changed");
        self.send_refresh();
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("backend");

        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(backend = %self.backend, logger = %logger, "{}", params.data);
            }
        }
    }
}
