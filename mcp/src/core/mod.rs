//! Backend connection infrastructure.

pub mod config;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod session;

pub use config::{
    qualified_name, BackendDescriptor, BackendTransport, GatewayConfig,
    DEFAULT_CONNECT_TIMEOUT_MS, NAMESPACE_SEPARATOR,
};
pub use handler::{GatewayClientHandler, RefreshReason, RefreshRequest};
pub use metrics::{CallGuard, GatewayMetrics, MetricsSnapshot};
pub use registry::{
    BackendConnection, BackendState, CapabilityDescriptor, ConnectOutcome, ConnectionRegistry,
};
pub use session::{BackendConnector, BackendSession, RmcpConnector, RmcpSession};
