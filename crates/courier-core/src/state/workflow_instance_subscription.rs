// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catching-side subscriptions, held by the partition of the workflow instance.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::key::{Key, PartitionId};
use crate::record::WorkflowInstanceSubscriptionRecord;

/// Phase of a catching-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowInstanceSubscriptionPhase {
    /// Open command sent, not acknowledged yet.
    Opening,
    /// Acknowledged by the message side.
    Opened,
    /// Close command sent, not acknowledged yet.
    Closing,
}

impl WorkflowInstanceSubscriptionPhase {
    /// Stable name used in logs and rejection reasons.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }
}

/// A subscription on the catching side.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstanceSubscription {
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
    /// Partition owning messages for the correlation key.
    pub subscription_partition_id: PartitionId,
    /// Element id triggered when a message arrives.
    pub handler_node_id: String,
    /// Remove once a message was correlated.
    pub close_on_correlate: bool,
    /// Current phase.
    pub phase: WorkflowInstanceSubscriptionPhase,
    /// Last time the pending command was sent.
    pub sent_time: i64,
}

impl WorkflowInstanceSubscription {
    /// Record view with an optional correlated message.
    pub fn to_record(&self, message_key: Key, variables: Value) -> WorkflowInstanceSubscriptionRecord {
        WorkflowInstanceSubscriptionRecord {
            subscription_partition_id: self.subscription_partition_id,
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

    fn pending_entry(&self) -> Option<(i64, Key, String)> {
        self.phase.is_pending().then(|| {
            (
                self.sent_time,
                self.element_instance_key,
                self.message_name.clone(),
            )
        })
    }
}

/// Catching-side subscriptions of a partition.
#[derive(Debug, Default)]
pub struct WorkflowInstanceSubscriptionState {
    subscriptions: BTreeMap<(Key, String), WorkflowInstanceSubscription>,
    by_sent_time: BTreeSet<(i64, Key, String)>,
}

impl WorkflowInstanceSubscriptionState {
    /// Store a subscription, replacing one with the same identity.
    pub fn put(&mut self, subscription: WorkflowInstanceSubscription) {
        self.remove(subscription.element_instance_key, &subscription.message_name);

        if let Some(entry) = subscription.pending_entry() {
            self.by_sent_time.insert(entry);
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
    pub fn get(
        &self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Option<&WorkflowInstanceSubscription> {
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

    /// Visit every subscription of an element instance.
    pub fn visit_element_subscriptions<F>(&self, element_instance_key: Key, mut visitor: F)
    where
        F: FnMut(&WorkflowInstanceSubscription) -> bool,
    {
        let from = (element_instance_key, String::new());
        let range = match element_instance_key.checked_add(1) {
            Some(next) => self.subscriptions.range(from..(next, String::new())),
            None => self.subscriptions.range(from..),
        };
        for (_, subscription) in range {
            if !visitor(subscription) {
                return;
            }
        }
    }

    /// Acknowledge an opening subscription.
    pub fn update_to_opened(&mut self, element_instance_key: Key, message_name: &str) -> bool {
        self.update(element_instance_key, message_name, |s| {
            s.phase = WorkflowInstanceSubscriptionPhase::Opened;
            s.sent_time = 0;
        })
    }

    /// Start closing a subscription.
    pub fn update_to_closing(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        sent_time: i64,
    ) -> bool {
        self.update(element_instance_key, message_name, |s| {
            s.phase = WorkflowInstanceSubscriptionPhase::Closing;
            s.sent_time = sent_time;
        })
    }

    /// Refresh the sent time of a pending subscription.
    pub fn update_sent_time(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        sent_time: i64,
    ) -> bool {
        self.update(element_instance_key, message_name, |s| {
            s.sent_time = sent_time;
        })
    }

    /// Visit opening and closing subscriptions sent before `timestamp`, oldest first.
    pub fn visit_subscriptions_sent_before<F>(&self, timestamp: i64, mut visitor: F)
    where
        F: FnMut(&WorkflowInstanceSubscription) -> bool,
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

    /// Remove a subscription.
    pub fn remove(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Option<WorkflowInstanceSubscription> {
        let subscription = self
            .subscriptions
            .remove(&(element_instance_key, message_name.to_string()))?;
        if let Some(entry) = subscription.pending_entry() {
            self.by_sent_time.remove(&entry);
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

    fn update<F>(&mut self, element_instance_key: Key, message_name: &str, change: F) -> bool
    where
        F: FnOnce(&mut WorkflowInstanceSubscription),
    {
        let Some(mut subscription) = self.remove(element_instance_key, message_name) else {
            return false;
        };
        change(&mut subscription);
        self.put(subscription);
        true
    }
}
