//! Handler registry
//!
//! Open map from a task-type identifier (the persisted `type` column) to
//! the handler implementing it. The web process and every worker process
//! register the same set at startup; rows whose type is not registered
//! fail to materialize with a TypeResolution error.

use crate::task::TaskHandler;
use conveyor_foundation::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of task handlers by type identifier
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a type identifier; replaces any previous
    /// registration for the same identifier
    pub fn register(&self, type_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(type_name.into(), handler);
    }

    /// Resolve the handler for a type identifier
    pub fn resolve(&self, type_name: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::TypeResolution(type_name.to_string()))
    }

    /// Check whether a type identifier is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.read().contains_key(type_name)
    }

    /// All registered type identifiers
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}
