// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message start event subscriptions of deployed workflows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::key::Key;
use crate::record::MessageStartEventSubscriptionRecord;

/// Start event subscriptions, keyed by `(message name, workflow key)`.
#[derive(Debug, Default)]
pub struct MessageStartEventSubscriptionState {
    subscriptions: BTreeMap<(String, Key), MessageStartEventSubscriptionRecord>,
    by_workflow_key: HashMap<Key, BTreeSet<String>>,
    by_process_id: HashMap<String, BTreeSet<(Key, String)>>,
}

impl MessageStartEventSubscriptionState {
    /// Store a subscription.
    pub fn put(&mut self, subscription: MessageStartEventSubscriptionRecord) {
        self.by_workflow_key
            .entry(subscription.workflow_key)
            .or_default()
            .insert(subscription.message_name.clone());
        self.by_process_id
            .entry(subscription.bpmn_process_id.clone())
            .or_default()
            .insert((subscription.workflow_key, subscription.message_name.clone()));
        self.subscriptions.insert(
            (subscription.message_name.clone(), subscription.workflow_key),
            subscription,
        );
    }

    /// Whether the workflow subscribed its start event to `message_name`.
    pub fn exists(&self, message_name: &str, workflow_key: Key) -> bool {
        self.subscriptions
            .contains_key(&(message_name.to_string(), workflow_key))
    }

    /// Visit start event subscriptions for a message name, by workflow key.
    pub fn visit_subscriptions_by_message_name<F>(&self, message_name: &str, mut visitor: F)
    where
        F: FnMut(&MessageStartEventSubscriptionRecord) -> bool,
    {
        let from = (message_name.to_string(), Key::MIN);
        let to = (message_name.to_string(), Key::MAX);
        for (_, subscription) in self.subscriptions.range(from..=to) {
            if !visitor(subscription) {
                return;
            }
        }
    }

    /// Every open start event subscription of a process.
    pub fn subscriptions_for_process(
        &self,
        bpmn_process_id: &str,
    ) -> Vec<MessageStartEventSubscriptionRecord> {
        self.by_process_id
            .get(bpmn_process_id)
            .into_iter()
            .flatten()
            .filter_map(|(workflow_key, message_name)| {
                self.subscriptions
                    .get(&(message_name.clone(), *workflow_key))
                    .cloned()
            })
            .collect()
    }

    /// Remove every subscription of a workflow and return them.
    pub fn remove_subscriptions_of_workflow(
        &mut self,
        workflow_key: Key,
    ) -> Vec<MessageStartEventSubscriptionRecord> {
        let Some(message_names) = self.by_workflow_key.remove(&workflow_key) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(message_names.len());
        for message_name in message_names {
            let Some(subscription) = self
                .subscriptions
                .remove(&(message_name.clone(), workflow_key))
            else {
                continue;
            };
            if let Some(entries) = self.by_process_id.get_mut(&subscription.bpmn_process_id) {
                entries.remove(&(workflow_key, message_name));
                if entries.is_empty() {
                    self.by_process_id.remove(&subscription.bpmn_process_id);
                }
            }
            removed.push(subscription);
        }
        removed
    }

    /// Workflow keys holding start event subscriptions of a process.
    pub fn workflow_keys_of_process(&self, bpmn_process_id: &str) -> Vec<Key> {
        let keys: BTreeSet<Key> = self
            .by_process_id
            .get(bpmn_process_id)
            .into_iter()
            .flatten()
            .map(|(workflow_key, _)| *workflow_key)
            .collect();
        keys.into_iter().collect()
    }
}
