// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-side subscriptions, held by the partition that owns the
//! correlation key.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::key::{Key, NO_KEY};
use crate::record::MessageSubscriptionRecord;

/// Phase of a message-side subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageSubscriptionPhase {
    /// Waiting for a message.
    Opened,
    /// A message was handed to the catching side and is not acknowledged yet.
    Correlating {
        /// Message being correlated.
        message_key: Key,
        /// Payload of that message.
        variables: Value,
        /// Last time the correlate command was sent.
        sent_time: i64,
    },
}

/// A subscription on the message side.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSubscription {
    /// Workflow instance holding the subscription.
    pub workflow_instance_key: Key,
    /// Catch event element instance.
    pub element_instance_key: Key,
    /// Process of the workflow instance.
    pub bpmn_process_id: String,
    /// Message name.
    pub message_name: String,
    /// Correlation key.
    pub correlation_key: String,
    /// Remove once a correlation was acknowledged.
    pub close_on_correlate: bool,
    /// Current phase.
    pub phase: MessageSubscriptionPhase,
}

impl MessageSubscription {
    /// New opened subscription from an open command.
    pub fn from_record(record: &MessageSubscriptionRecord) -> Self {
        Self {
            workflow_instance_key: record.workflow_instance_key,
            element_instance_key: record.element_instance_key,
            bpmn_process_id: record.bpmn_process_id.clone(),
            message_name: record.message_name.clone(),
            correlation_key: record.correlation_key.clone(),
            close_on_correlate: record.close_on_correlate,
            phase: MessageSubscriptionPhase::Opened,
        }
    }

    /// Whether a correlation is in flight.
    pub fn is_correlating(&self) -> bool {
        matches!(self.phase, MessageSubscriptionPhase::Correlating { .. })
    }

    /// Record view, carrying the in-flight message if correlating.
    pub fn to_record(&self) -> MessageSubscriptionRecord {
        let (message_key, variables) = match &self.phase {
            MessageSubscriptionPhase::Opened => (NO_KEY, Value::Null),
            MessageSubscriptionPhase::Correlating {
                message_key,
                variables,
                ..
            } => (*message_key, variables.clone()),
        };

        MessageSubscriptionRecord {
            workflow_instance_key: self.workflow_instance_key,
            element_instance_key: self.element_instance_key,
            bpmn_process_id: self.bpmn_process_id.clone(),
            message_key,
            message_name: self.message_name.clone(),
            correlation_key: self.correlation_key.clone(),
            close_on_correlate: self.close_on_correlate,
            variables,
        }
    }

    fn sent_time(&self) -> Option<i64> {
        match self.phase {
            MessageSubscriptionPhase::Opened => None,
            MessageSubscriptionPhase::Correlating { sent_time, .. } => Some(sent_time),
        }
    }
}

/// Message-side subscriptions of a partition.
///
/// Only correlating subscriptions are present in the sent-time index, so the
/// pending checker never sees opened ones.
#[derive(Debug, Default)]
pub struct MessageSubscriptionState {
    subscriptions: BTreeMap<(Key, String), MessageSubscription>,
    by_name_and_correlation_key: BTreeSet<(String, String, Key)>,
    by_sent_time: BTreeSet<(i64, Key, String)>,
}

impl MessageSubscriptionState {
    /// Store a subscription, replacing one with the same identity.
    pub fn put(&mut self, subscription: MessageSubscription) {
        self.remove(subscription.element_instance_key, &subscription.message_name);

        self.by_name_and_correlation_key.insert((
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
            subscription.element_instance_key,
        ));
        if let Some(sent_time) = subscription.sent_time() {
            self.by_sent_time.insert((
                sent_time,
                subscription.element_instance_key,
                subscription.message_name.clone(),
            ));
        }
        self.subscriptions.insert(
            (
                subscription.element_instance_key,
                subscription.message_name.clone(),
            ),
            subscription,
        );
    }

    /// Look up a subscription.
    pub fn get(&self, element_instance_key: Key, message_name: &str) -> Option<&MessageSubscription> {
        self.subscriptions
            .get(&(element_instance_key, message_name.to_string()))
    }

    /// Whether the element instance already subscribed to this message name.
    pub fn exist_subscription_for_element_instance(
        &self,
        element_instance_key: Key,
        message_name: &str,
    ) -> bool {
        self.get(element_instance_key, message_name).is_some()
    }

    /// Visit subscriptions on `(message_name, correlation_key)` by element instance key.
    pub fn visit_subscriptions<F>(&self, message_name: &str, correlation_key: &str, mut visitor: F)
    where
        F: FnMut(&MessageSubscription) -> bool,
    {
        let from = (message_name.to_string(), correlation_key.to_string(), Key::MIN);
        let to = (message_name.to_string(), correlation_key.to_string(), Key::MAX);

        for (name, _, element_instance_key) in self.by_name_and_correlation_key.range(from..=to) {
            if let Some(subscription) = self
                .subscriptions
                .get(&(*element_instance_key, name.clone()))
            {
                if !visitor(subscription) {
                    return;
                }
            }
        }
    }

    /// Move a subscription into the correlating phase.
    pub fn update_to_correlating(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        message_key: Key,
        variables: Value,
        sent_time: i64,
    ) -> bool {
        self.update_phase(
            element_instance_key,
            message_name,
            MessageSubscriptionPhase::Correlating {
                message_key,
                variables,
                sent_time,
            },
        )
    }

    /// Move a subscription back to opened, clearing its sent time.
    pub fn update_to_opened(&mut self, element_instance_key: Key, message_name: &str) -> bool {
        self.update_phase(
            element_instance_key,
            message_name,
            MessageSubscriptionPhase::Opened,
        )
    }

    /// Refresh the sent time of a correlating subscription.
    pub fn update_sent_time(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        sent_time: i64,
    ) -> bool {
        let Some(subscription) = self.get(element_instance_key, message_name) else {
            return false;
        };
        let MessageSubscriptionPhase::Correlating {
            message_key,
            variables,
            ..
        } = &subscription.phase
        else {
            return false;
        };
        let phase = MessageSubscriptionPhase::Correlating {
            message_key: *message_key,
            variables: variables.clone(),
            sent_time,
        };
        self.update_phase(element_instance_key, message_name, phase)
    }

    /// Visit correlating subscriptions sent before `timestamp`, oldest first.
    pub fn visit_subscriptions_sent_before<F>(&self, timestamp: i64, mut visitor: F)
    where
        F: FnMut(&MessageSubscription) -> bool,
    {
        for (_, element_instance_key, message_name) in
            self.by_sent_time.range(..(timestamp, Key::MIN, String::new()))
        {
            if let Some(subscription) = self
                .subscriptions
                .get(&(*element_instance_key, message_name.clone()))
            {
                if !visitor(subscription) {
                    return;
                }
            }
        }
    }

    /// Remove a subscription and its index entries.
    pub fn remove(&mut self, element_instance_key: Key, message_name: &str) -> Option<MessageSubscription> {
        let subscription = self
            .subscriptions
            .remove(&(element_instance_key, message_name.to_string()))?;

        self.by_name_and_correlation_key.remove(&(
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
            element_instance_key,
        ));
        if let Some(sent_time) = subscription.sent_time() {
            self.by_sent_time.remove(&(
                sent_time,
                element_instance_key,
                subscription.message_name.clone(),
            ));
        }

        Some(subscription)
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn update_phase(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        phase: MessageSubscriptionPhase,
    ) -> bool {
        let Some(mut subscription) = self.remove(element_instance_key, message_name) else {
            return false;
        };
        subscription.phase = phase;
        self.put(subscription);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(element_instance_key: Key, name: &str, correlation_key: &str) -> MessageSubscription {
        MessageSubscription {
            workflow_instance_key: 100,
            element_instance_key,
            bpmn_process_id: "process".to_string(),
            message_name: name.to_string(),
            correlation_key: correlation_key.to_string(),
            close_on_correlate: true,
            phase: MessageSubscriptionPhase::Opened,
        }
    }

    fn visit_keys(state: &MessageSubscriptionState, name: &str, correlation_key: &str) -> Vec<Key> {
        let mut keys = Vec::new();
        state.visit_subscriptions(name, correlation_key, |s| {
            keys.push(s.element_instance_key);
            true
        });
        keys
    }

    fn sent_before(state: &MessageSubscriptionState, timestamp: i64) -> Vec<Key> {
        let mut keys = Vec::new();
        state.visit_subscriptions_sent_before(timestamp, |s| {
            keys.push(s.element_instance_key);
            true
        });
        keys
    }

    #[test]
    fn test_put_and_visit_by_name_and_correlation_key() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(2, "payment", "order-1"));
        state.put(subscription(1, "payment", "order-1"));
        state.put(subscription(3, "payment", "order-2"));

        assert_eq!(visit_keys(&state, "payment", "order-1"), vec![1, 2]);
        assert!(state.exist_subscription_for_element_instance(3, "payment"));
        assert!(!state.exist_subscription_for_element_instance(3, "invoice"));
    }

    #[test]
    fn test_only_correlating_subscriptions_are_pending() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(1, "payment", "order-1"));
        state.put(subscription(2, "payment", "order-1"));

        assert!(sent_before(&state, i64::MAX).is_empty());

        assert!(state.update_to_correlating(1, "payment", 50, json!({"x": 1}), 1_000));
        assert_eq!(sent_before(&state, 1_001), vec![1]);
        assert!(sent_before(&state, 1_000).is_empty());

        let record = state.get(1, "payment").unwrap().to_record();
        assert_eq!(record.message_key, 50);
        assert_eq!(record.variables, json!({"x": 1}));
    }

    #[test]
    fn test_update_sent_time_moves_index_entry() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(1, "payment", "order-1"));
        state.update_to_correlating(1, "payment", 50, Value::Null, 1_000);

        assert!(state.update_sent_time(1, "payment", 5_000));
        assert!(sent_before(&state, 2_000).is_empty());
        assert_eq!(sent_before(&state, 5_001), vec![1]);
    }

    #[test]
    fn test_update_sent_time_ignores_opened_subscription() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(1, "payment", "order-1"));
        assert!(!state.update_sent_time(1, "payment", 5_000));
        assert!(!state.update_sent_time(9, "payment", 5_000));
    }

    #[test]
    fn test_update_to_opened_clears_pending() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(1, "payment", "order-1"));
        state.update_to_correlating(1, "payment", 50, Value::Null, 1_000);

        assert!(state.update_to_opened(1, "payment"));
        assert!(sent_before(&state, i64::MAX).is_empty());
        assert!(!state.get(1, "payment").unwrap().is_correlating());
        assert_eq!(state.get(1, "payment").unwrap().to_record().message_key, NO_KEY);
    }

    #[test]
    fn test_remove_clears_indices() {
        let mut state = MessageSubscriptionState::default();
        state.put(subscription(1, "payment", "order-1"));
        state.update_to_correlating(1, "payment", 50, Value::Null, 1_000);

        let removed = state.remove(1, "payment").unwrap();
        assert_eq!(removed.element_instance_key, 1);
        assert!(state.is_empty());
        assert!(visit_keys(&state, "payment", "order-1").is_empty());
        assert!(sent_before(&state, i64::MAX).is_empty());
        assert!(state.remove(1, "payment").is_none());
    }
}
