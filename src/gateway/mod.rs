//! Upstream side of the gateway: orchestration, proxies and meta-operations.

pub mod meta;
pub mod orchestrator;
pub mod proxy_table;
pub mod service;

pub use orchestrator::{BackendPhase, Gateway};
pub use proxy_table::{ProxyTable, RegisteredProxy, Registration};
pub use service::GatewayService;
