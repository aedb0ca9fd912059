//! Rule-name to mutation-handler table
//!
//! Written only by the Rule controller, read by every admission request.
//! A missing entry is a normal state (the Rule may have been deleted while
//! requests were in flight) and callers allow such requests unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::handler::RuleHandler;

/// Concurrent mapping from Rule name to its handler
#[derive(Default)]
pub struct RoutingTable {
    handlers: RwLock<HashMap<String, Arc<RuleHandler>>>,
}

impl RoutingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler registered for `rule`, if any
    pub fn lookup(&self, rule: &str) -> Option<Arc<RuleHandler>> {
        self.handlers.read().get(rule).cloned()
    }

    /// Register or replace the handler for `rule`
    pub fn upsert(&self, rule: impl Into<String>, handler: RuleHandler) {
        self.handlers.write().insert(rule.into(), Arc::new(handler));
    }

    /// Drop the handler for `rule`, returning whether one existed
    pub fn remove(&self, rule: &str) -> bool {
        self.handlers.write().remove(rule).is_some()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
