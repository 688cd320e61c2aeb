// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message store of a partition.
//!
//! Messages are indexed by `(name, correlation key, message key)` so matching
//! walks candidates in publish order, and by `(deadline, message key)` for the
//! TTL sweep. Correlation markers and correlation-key locks live here too since
//! their lifetime is tied to the stored messages.

use std::collections::{BTreeSet, HashMap};

use crate::key::Key;
use crate::record::MessageRecord;

/// A message held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Message key assigned on publish.
    pub key: Key,
    /// Published value.
    pub message: MessageRecord,
    /// Publish time plus TTL, epoch milliseconds.
    pub deadline: i64,
}

impl StoredMessage {
    /// Whether the TTL ran out at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.deadline <= now
    }
}

type MessageIdKey = (String, String, String);

/// Messages, correlation markers and correlation-key locks.
#[derive(Debug, Default)]
pub struct MessageState {
    messages: HashMap<Key, StoredMessage>,
    by_name_and_correlation_key: BTreeSet<(String, String, Key)>,
    by_deadline: BTreeSet<(i64, Key)>,
    message_ids: HashMap<MessageIdKey, Key>,
    correlated_instances: BTreeSet<(Key, Key)>,
    correlated_processes: BTreeSet<(Key, String)>,
    active_process_instances: HashMap<(String, String), Key>,
    instance_correlation_keys: HashMap<Key, String>,
}

impl MessageState {
    /// Store a message. Callers check [`MessageState::exist`] first.
    pub fn put(&mut self, stored: StoredMessage) {
        let key = stored.key;
        let message = &stored.message;

        self.by_name_and_correlation_key.insert((
            message.name.clone(),
            message.correlation_key.clone(),
            key,
        ));
        self.by_deadline.insert((stored.deadline, key));
        if message.has_message_id() {
            self.message_ids.insert(
                (
                    message.name.clone(),
                    message.correlation_key.clone(),
                    message.message_id.clone(),
                ),
                key,
            );
        }
        self.messages.insert(key, stored);
    }

    /// Look up a message by key.
    pub fn get(&self, key: Key) -> Option<&StoredMessage> {
        self.messages.get(&key)
    }

    /// Whether a message with this id is stored for `(name, correlation_key)`.
    pub fn exist(&self, name: &str, correlation_key: &str, message_id: &str) -> bool {
        self.message_ids.contains_key(&(
            name.to_string(),
            correlation_key.to_string(),
            message_id.to_string(),
        ))
    }

    /// Visit messages matching `(name, correlation_key)` in message key order.
    ///
    /// Stops as soon as `visitor` returns `false`.
    pub fn visit_messages<F>(&self, name: &str, correlation_key: &str, mut visitor: F)
    where
        F: FnMut(&StoredMessage) -> bool,
    {
        let from = (name.to_string(), correlation_key.to_string(), Key::MIN);
        let to = (name.to_string(), correlation_key.to_string(), Key::MAX);

        for (_, _, key) in self.by_name_and_correlation_key.range(from..=to) {
            if let Some(stored) = self.messages.get(key) {
                if !visitor(stored) {
                    return;
                }
            }
        }
    }

    /// Visit messages whose deadline is at or before `timestamp`, earliest first.
    pub fn visit_messages_with_deadline_before<F>(&self, timestamp: i64, mut visitor: F)
    where
        F: FnMut(&StoredMessage) -> bool,
    {
        for (_, key) in self.by_deadline.range(..=(timestamp, Key::MAX)) {
            if let Some(stored) = self.messages.get(key) {
                if !visitor(stored) {
                    return;
                }
            }
        }
    }

    /// Remove a message with its id and every correlation marker.
    pub fn remove(&mut self, key: Key) -> Option<StoredMessage> {
        let stored = self.messages.remove(&key)?;
        let message = &stored.message;

        self.by_name_and_correlation_key.remove(&(
            message.name.clone(),
            message.correlation_key.clone(),
            key,
        ));
        self.by_deadline.remove(&(stored.deadline, key));

        if message.has_message_id() {
            let id_key = (
                message.name.clone(),
                message.correlation_key.clone(),
                message.message_id.clone(),
            );
            if self.message_ids.get(&id_key) == Some(&key) {
                self.message_ids.remove(&id_key);
            }
        }

        let instances: Vec<(Key, Key)> = self
            .correlated_instances
            .range((key, Key::MIN)..=(key, Key::MAX))
            .copied()
            .collect();
        for marker in instances {
            self.correlated_instances.remove(&marker);
        }

        let processes: Vec<(Key, String)> = self
            .correlated_processes
            .range((key, String::new())..(key.saturating_add(1), String::new()))
            .cloned()
            .collect();
        for marker in processes {
            self.correlated_processes.remove(&marker);
        }

        Some(stored)
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message is stored.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // ------------------------------------------------------------------------
    // Correlation markers
    // ------------------------------------------------------------------------

    /// Record that `message_key` was correlated to `workflow_instance_key`.
    pub fn put_message_correlation(&mut self, message_key: Key, workflow_instance_key: Key) {
        self.correlated_instances
            .insert((message_key, workflow_instance_key));
    }

    /// Whether `message_key` was already correlated to `workflow_instance_key`.
    pub fn exist_message_correlation(&self, message_key: Key, workflow_instance_key: Key) -> bool {
        self.correlated_instances
            .contains(&(message_key, workflow_instance_key))
    }

    /// Drop the marker of `message_key` for `workflow_instance_key`.
    pub fn remove_message_correlation(&mut self, message_key: Key, workflow_instance_key: Key) {
        self.correlated_instances
            .remove(&(message_key, workflow_instance_key));
    }

    /// Record that `message_key` started an instance of `bpmn_process_id`.
    pub fn put_process_correlation(&mut self, message_key: Key, bpmn_process_id: &str) {
        self.correlated_processes
            .insert((message_key, bpmn_process_id.to_string()));
    }

    /// Whether `message_key` already started an instance of `bpmn_process_id`.
    pub fn exist_process_correlation(&self, message_key: Key, bpmn_process_id: &str) -> bool {
        self.correlated_processes
            .contains(&(message_key, bpmn_process_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Correlation-key locks
    // ------------------------------------------------------------------------

    /// Mark `workflow_instance_key` as the live instance of
    /// `(bpmn_process_id, correlation_key)`.
    pub fn lock_correlation_key(
        &mut self,
        bpmn_process_id: &str,
        correlation_key: &str,
        workflow_instance_key: Key,
    ) {
        self.active_process_instances.insert(
            (bpmn_process_id.to_string(), correlation_key.to_string()),
            workflow_instance_key,
        );
        self.instance_correlation_keys
            .insert(workflow_instance_key, correlation_key.to_string());
    }

    /// Whether a live instance holds `(bpmn_process_id, correlation_key)`.
    pub fn is_correlation_key_locked(&self, bpmn_process_id: &str, correlation_key: &str) -> bool {
        self.active_process_instances
            .contains_key(&(bpmn_process_id.to_string(), correlation_key.to_string()))
    }

    /// Correlation key locked by `workflow_instance_key`, if any.
    pub fn correlation_key_of_instance(&self, workflow_instance_key: Key) -> Option<&str> {
        self.instance_correlation_keys
            .get(&workflow_instance_key)
            .map(String::as_str)
    }

    /// Release the lock held by `workflow_instance_key` and return its key.
    pub fn release_correlation_key(
        &mut self,
        bpmn_process_id: &str,
        workflow_instance_key: Key,
    ) -> Option<String> {
        let correlation_key = self.instance_correlation_keys.remove(&workflow_instance_key)?;
        let lock = (bpmn_process_id.to_string(), correlation_key);
        if self.active_process_instances.get(&lock) == Some(&workflow_instance_key) {
            self.active_process_instances.remove(&lock);
        }
        Some(lock.1)
    }
}
