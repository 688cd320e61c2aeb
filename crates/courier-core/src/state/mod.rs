// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state of one partition.
//!
//! The state is owned by the partition's single processing loop. Processors
//! receive `&mut PartitionState`; nothing else mutates it.

/// Message store, correlation markers and correlation-key locks.
pub mod message;
/// Message start event subscriptions.
pub mod message_start_event_subscription;
/// Message-side subscriptions.
pub mod message_subscription;
/// Catching-side subscriptions.
pub mod workflow_instance_subscription;

pub use message::{MessageState, StoredMessage};
pub use message_start_event_subscription::MessageStartEventSubscriptionState;
pub use message_subscription::{
    MessageSubscription, MessageSubscriptionPhase, MessageSubscriptionState,
};
pub use workflow_instance_subscription::{
    WorkflowInstanceSubscription, WorkflowInstanceSubscriptionPhase,
    WorkflowInstanceSubscriptionState,
};

use crate::key::{Key, KeyGenerator, PartitionId};

/// All stores of a partition plus its key generator.
#[derive(Debug)]
pub struct PartitionState {
    /// Messages published to this partition.
    pub messages: MessageState,
    /// Message-side subscriptions.
    pub message_subscriptions: MessageSubscriptionState,
    /// Catching-side subscriptions.
    pub workflow_instance_subscriptions: WorkflowInstanceSubscriptionState,
    /// Message start event subscriptions.
    pub start_event_subscriptions: MessageStartEventSubscriptionState,
    key_generator: KeyGenerator,
}

impl PartitionState {
    /// Empty state for a partition.
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            messages: MessageState::default(),
            message_subscriptions: MessageSubscriptionState::default(),
            workflow_instance_subscriptions: WorkflowInstanceSubscriptionState::default(),
            start_event_subscriptions: MessageStartEventSubscriptionState::default(),
            key_generator: KeyGenerator::new(partition_id),
        }
    }

    /// Partition owning this state.
    pub fn partition_id(&self) -> PartitionId {
        self.key_generator.partition_id()
    }

    /// Next key of this partition.
    pub fn next_key(&mut self) -> Key {
        self.key_generator.next_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::decode_partition_id;

    #[test]
    fn test_partition_state_keys_carry_partition() {
        let mut state = PartitionState::new(3);
        let key = state.next_key();
        assert_eq!(decode_partition_id(key), 3);
        assert_eq!(state.partition_id(), 3);
        assert!(state.next_key() > key);
    }
}
