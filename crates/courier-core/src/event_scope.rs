// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The single call the correlation core makes into workflow execution.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::key::Key;

/// Execution-engine hook that lets a message continue a workflow.
pub trait EventScope: Send + Sync {
    /// Trigger `element_id` inside `scope_key` (an element instance, or a
    /// workflow key for start events).
    ///
    /// Returns `false` when the scope no longer accepts triggers; callers treat
    /// that as a correlation failure.
    fn trigger_event(&self, scope_key: Key, event_key: Key, element_id: &str, variables: &Value)
    -> bool;

    /// Whether `scope_key` would accept a trigger right now. Checked for every
    /// start event of a message before any of them fires.
    fn accepts_trigger(&self, scope_key: Key) -> bool;
}

/// A trigger accepted by [`EventScopeRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventTrigger {
    /// Scope that was triggered.
    pub scope_key: Key,
    /// Event key (message key, or new workflow instance key for start events).
    pub event_key: Key,
    /// Triggered element.
    pub element_id: String,
    /// Payload.
    pub variables: Value,
}

#[derive(Debug, Default)]
struct RegistryInner {
    open_scopes: HashSet<Key>,
    triggers: Vec<EventTrigger>,
}

/// In-memory [`EventScope`]: scopes accept triggers while open.
///
/// Clones share the same scopes and trigger history.
#[derive(Debug, Clone, Default)]
pub struct EventScopeRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl EventScopeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `scope_key` accept triggers.
    pub fn open_scope(&self, scope_key: Key) {
        self.lock().open_scopes.insert(scope_key);
    }

    /// Stop accepting triggers for `scope_key`.
    pub fn close_scope(&self, scope_key: Key) {
        self.lock().open_scopes.remove(&scope_key);
    }

    /// Whether `scope_key` accepts triggers.
    pub fn is_open(&self, scope_key: Key) -> bool {
        self.lock().open_scopes.contains(&scope_key)
    }

    /// Every accepted trigger in order.
    pub fn triggers(&self) -> Vec<EventTrigger> {
        self.lock().triggers.clone()
    }

    /// Accepted triggers for one scope.
    pub fn triggers_of(&self, scope_key: Key) -> Vec<EventTrigger> {
        self.lock()
            .triggers
            .iter()
            .filter(|t| t.scope_key == scope_key)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventScope for EventScopeRegistry {
    fn trigger_event(
        &self,
        scope_key: Key,
        event_key: Key,
        element_id: &str,
        variables: &Value,
    ) -> bool {
        let mut inner = self.lock();
        if !inner.open_scopes.contains(&scope_key) {
            return false;
        }
        inner.triggers.push(EventTrigger {
            scope_key,
            event_key,
            element_id: element_id.to_string(),
            variables: variables.clone(),
        });
        true
    }

    fn accepts_trigger(&self, scope_key: Key) -> bool {
        self.is_open(scope_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closed_scope_refuses_trigger() {
        let registry = EventScopeRegistry::new();
        assert!(!registry.trigger_event(1, 2, "catch", &Value::Null));
        assert!(registry.triggers().is_empty());
    }

    #[test]
    fn test_open_scope_records_trigger() {
        let registry = EventScopeRegistry::new();
        registry.open_scope(1);

        assert!(registry.trigger_event(1, 2, "catch", &json!({"x": 1})));
        let triggers = registry.triggers_of(1);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].event_key, 2);
        assert_eq!(triggers[0].variables, json!({"x": 1}));

        registry.close_scope(1);
        assert!(!registry.is_open(1));
        assert!(!registry.accepts_trigger(1));
        assert!(!registry.trigger_event(1, 3, "catch", &Value::Null));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = EventScopeRegistry::new();
        let clone = registry.clone();
        clone.open_scope(7);
        assert!(registry.is_open(7));
    }
}
