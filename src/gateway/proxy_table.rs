//! Table of proxies exposed on the upstream endpoint.
//!
//! Grow-only: entries are added or replaced, never removed. Declaration
//! order is kept so `tools/list` is stable across calls.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use rmcp::model::Tool;
use toolgate_mcp::{CapabilityDescriptor, ParamSchema};
use tracing::{debug, warn};

use super::meta;

/// A backend capability registered under its upstream name.
#[derive(Debug, Clone)]
pub struct RegisteredProxy {
    pub exposed_name: String,
    pub capability: CapabilityDescriptor,
    /// Translated once at registration, used for every call.
    pub schema: Arc<ParamSchema>,
    /// Declaration returned by `tools/list`.
    pub tool: Tool,
}

impl RegisteredProxy {
    pub fn new(exposed_name: String, capability: CapabilityDescriptor) -> Self {
        let schema = ParamSchema::translate_input(&capability.parameter_schema);
        let description = if capability.description.is_empty() {
            format!("[{}]", capability.owning_backend)
        } else {
            format!("[{}] {}", capability.owning_backend, capability.description)
        };
        let tool = Tool::new(
            exposed_name.clone(),
            description,
            Arc::new(schema.to_input_schema()),
        );

        Self {
            exposed_name,
            capability,
            schema: Arc::new(schema),
            tool,
        }
    }

    pub fn backend(&self) -> &str {
        &self.capability.owning_backend
    }
}

/// What [`ProxyTable::register`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Same backend capability registered again; descriptor updated.
    Refreshed,
    /// Another backend's proxy held this name (bare-name mode). Last wins.
    Replaced,
    /// Name collides with a meta-operation; not registered.
    Reserved,
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    by_name: HashMap<String, Arc<RegisteredProxy>>,
}

#[derive(Default)]
pub struct ProxyTable {
    entries: RwLock<Entries>,
}

impl ProxyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proxy: RegisteredProxy) -> Registration {
        if meta::is_reserved(&proxy.exposed_name) {
            warn!(
                tool = %proxy.exposed_name,
                backend = %proxy.backend(),
                "Capability name is reserved for a gateway operation, skipping"
            );
            return Registration::Reserved;
        }

        let mut entries = self.entries.write();
        let name = proxy.exposed_name.clone();
        let outcome = match entries.by_name.get(&name) {
            None => {
                entries.order.push(name.clone());
                Registration::Added
            }
            Some(existing) if existing.backend() == proxy.backend() => Registration::Refreshed,
            Some(existing) => {
                warn!(
                    tool = %name,
                    previous = %existing.backend(),
                    backend = %proxy.backend(),
                    "Tool name collision, last registration wins"
                );
                Registration::Replaced
            }
        };
        debug!(tool = %name, outcome = ?outcome, "Proxy registered");
        entries.by_name.insert(name, Arc::new(proxy));
        outcome
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredProxy>> {
        self.entries.read().by_name.get(name).cloned()
    }

    /// All proxies in first-registration order.
    pub fn list(&self) -> Vec<Arc<RegisteredProxy>> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.by_name.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
