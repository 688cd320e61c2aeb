// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-partition subscription commands.
//!
//! Every method reports whether the transport accepted the command, not
//! whether it was delivered or applied. Lost commands are resent by the
//! pending checkers.
//!
//! ```text
//!   catching partition                         message partition
//!   ------------------                         -----------------
//!   open_message_subscription        ───────►  OpenMessageSubscription
//!   OpenWorkflowInstanceSubscription ◄───────  open_workflow_instance_subscription
//!   CorrelateWorkflowInstanceSub.    ◄───────  correlate_workflow_instance_subscription
//!   correlate_message_subscription   ───────►  CorrelateMessageSubscription
//!   reject_correlate_message_sub.    ───────►  RejectMessageSubscription
//!   close_message_subscription       ───────►  CloseMessageSubscription
//!   CloseWorkflowInstanceSubscription◄───────  close_workflow_instance_subscription
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::key::{PartitionId, decode_partition_id};
use crate::record::{
    Command, CommandBody, MessageSubscriptionRecord, WorkflowInstanceSubscriptionRecord,
};

/// Transport for subscription commands between partitions.
pub trait SubscriptionCommandSender: Send + Sync {
    /// Hand a command to the transport. Returns `true` if it was accepted.
    fn send(&self, partition_id: PartitionId, command: Command) -> bool;

    /// Ask the message partition to open its side of a subscription.
    fn open_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        record: MessageSubscriptionRecord,
    ) -> bool {
        self.send(
            subscription_partition_id,
            Command::unkeyed(CommandBody::OpenMessageSubscription(record)),
        )
    }

    /// Acknowledge an open to the catching partition.
    fn open_workflow_instance_subscription(&self, record: WorkflowInstanceSubscriptionRecord) -> bool {
        self.send(
            decode_partition_id(record.workflow_instance_key),
            Command::unkeyed(CommandBody::OpenWorkflowInstanceSubscription(record)),
        )
    }

    /// Hand a correlated message to the catching partition.
    fn correlate_workflow_instance_subscription(
        &self,
        record: WorkflowInstanceSubscriptionRecord,
    ) -> bool {
        self.send(
            decode_partition_id(record.workflow_instance_key),
            Command::unkeyed(CommandBody::CorrelateWorkflowInstanceSubscription(record)),
        )
    }

    /// Acknowledge a correlation to the message partition.
    fn correlate_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        record: MessageSubscriptionRecord,
    ) -> bool {
        self.send(
            subscription_partition_id,
            Command::unkeyed(CommandBody::CorrelateMessageSubscription(record)),
        )
    }

    /// Ask the message partition to close its side of a subscription.
    fn close_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        record: MessageSubscriptionRecord,
    ) -> bool {
        self.send(
            subscription_partition_id,
            Command::unkeyed(CommandBody::CloseMessageSubscription(record)),
        )
    }

    /// Acknowledge a close to the catching partition.
    fn close_workflow_instance_subscription(
        &self,
        record: WorkflowInstanceSubscriptionRecord,
    ) -> bool {
        self.send(
            decode_partition_id(record.workflow_instance_key),
            Command::unkeyed(CommandBody::CloseWorkflowInstanceSubscription(record)),
        )
    }

    /// Tell the message partition that a correlation could not be honoured.
    fn reject_correlate_message_subscription(
        &self,
        subscription_partition_id: PartitionId,
        record: MessageSubscriptionRecord,
    ) -> bool {
        self.send(
            subscription_partition_id,
            Command::unkeyed(CommandBody::RejectMessageSubscription(record)),
        )
    }
}

/// Sender that queues commands in memory for a caller-driven delivery loop.
///
/// Clones share the queue. While not accepting, sends return `false` and the
/// command is dropped.
#[derive(Debug, Clone)]
pub struct QueuedCommandSender {
    queue: Arc<Mutex<VecDeque<(PartitionId, Command)>>>,
    accepting: Arc<AtomicBool>,
}

impl Default for QueuedCommandSender {
    fn default() -> Self {
        Self {
            queue: Arc::default(),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl QueuedCommandSender {
    /// Empty, accepting sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or refuse subsequent sends.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Take the oldest queued command.
    pub fn pop(&self) -> Option<(PartitionId, Command)> {
        self.lock().pop_front()
    }

    /// Take every queued command.
    pub fn drain(&self) -> Vec<(PartitionId, Command)> {
        self.lock().drain(..).collect()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(PartitionId, Command)>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SubscriptionCommandSender for QueuedCommandSender {
    fn send(&self, partition_id: PartitionId, command: Command) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.lock().push_back((partition_id, command));
        true
    }
}
