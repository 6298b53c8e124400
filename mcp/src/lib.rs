//! Backend side of the toolgate MCP gateway.
//!
//! ## Modules
//!
//! - [`core`]: descriptors, backend sessions and the connection registry
//! - [`schema`]: translation of backend-declared parameter schemas
//! - [`error`]: the gateway error taxonomy

pub mod core;
pub mod error;
pub mod schema;

pub use self::core::{config, registry};
pub use self::core::{
    BackendConnection, BackendConnector, BackendDescriptor, BackendSession, BackendState,
    BackendTransport, CapabilityDescriptor, ConnectOutcome, ConnectionRegistry,
    GatewayClientHandler, GatewayConfig, GatewayMetrics, MetricsSnapshot, RefreshReason,
    RefreshRequest, RmcpConnector, RmcpSession, NAMESPACE_SEPARATOR,
};
pub use error::{McpError, McpResult};
pub use schema::{ParamKind, ParamSchema, SchemaViolation};
