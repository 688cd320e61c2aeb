// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resends cross-partition commands that were never acknowledged.
//!
//! Both sides of a subscription keep the time they last sent a command that
//! still waits for its acknowledgement. A checker runs periodically on the
//! partition that owns the state and resends every command older than the
//! timeout:
//!
//! - message side: correlating subscriptions resend
//!   `correlate_workflow_instance_subscription`
//! - catching side: opening subscriptions resend `open_message_subscription`,
//!   closing ones resend `close_message_subscription`
//!
//! The sent time only moves forward when the transport accepted the resend,
//! so a refused send is retried on the next cycle. Duplicates are absorbed by
//! the processors.

use std::time::Duration;

use tracing::{debug, info};

use crate::command_sender::SubscriptionCommandSender;
use crate::processor::catch_event::message_subscription_record;
use crate::state::{MessageSubscription, PartitionState, WorkflowInstanceSubscription, WorkflowInstanceSubscriptionPhase};

fn cutoff(now: i64, timeout: Duration) -> i64 {
    let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(timeout)
}

/// Resends correlate commands of message-side subscriptions.
#[derive(Debug, Clone)]
pub struct PendingMessageSubscriptionChecker {
    timeout: Duration,
}

impl PendingMessageSubscriptionChecker {
    /// Checker resending commands older than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resend every overdue correlation and return how many were accepted.
    pub fn check(
        &self,
        state: &mut PartitionState,
        sender: &dyn SubscriptionCommandSender,
        now: i64,
    ) -> usize {
        let mut pending: Vec<MessageSubscription> = Vec::new();
        state
            .message_subscriptions
            .visit_subscriptions_sent_before(cutoff(now, self.timeout), |subscription| {
                pending.push(subscription.clone());
                true
            });

        let partition_id = state.partition_id();
        let mut resent = 0;
        for subscription in pending {
            let record = subscription
                .to_record()
                .to_workflow_instance_subscription_record(partition_id);
            let message_key = record.message_key;
            if !sender.correlate_workflow_instance_subscription(record) {
                continue;
            }
            state.message_subscriptions.update_sent_time(
                subscription.element_instance_key,
                &subscription.message_name,
                now,
            );
            resent += 1;
            debug!(
                element_instance_key = subscription.element_instance_key,
                message_name = %subscription.message_name,
                message_key,
                "Resent correlate command"
            );
        }

        if resent > 0 {
            info!(partition_id, resent, "Resent pending message subscription commands");
        }
        resent
    }
}

/// Resends open and close commands of catching-side subscriptions.
#[derive(Debug, Clone)]
pub struct PendingWorkflowInstanceSubscriptionChecker {
    timeout: Duration,
}

impl PendingWorkflowInstanceSubscriptionChecker {
    /// Checker resending commands older than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resend every overdue open or close and return how many were accepted.
    pub fn check(
        &self,
        state: &mut PartitionState,
        sender: &dyn SubscriptionCommandSender,
        now: i64,
    ) -> usize {
        let mut pending: Vec<WorkflowInstanceSubscription> = Vec::new();
        state
            .workflow_instance_subscriptions
            .visit_subscriptions_sent_before(cutoff(now, self.timeout), |subscription| {
                pending.push(subscription.clone());
                true
            });

        let mut resent = 0;
        for subscription in pending {
            let record = message_subscription_record(&subscription);
            let target = subscription.subscription_partition_id;
            let accepted = match subscription.phase {
                WorkflowInstanceSubscriptionPhase::Opening => {
                    sender.open_message_subscription(target, record)
                }
                WorkflowInstanceSubscriptionPhase::Closing => {
                    sender.close_message_subscription(target, record)
                }
                WorkflowInstanceSubscriptionPhase::Opened => continue,
            };
            if !accepted {
                continue;
            }
            state.workflow_instance_subscriptions.update_sent_time(
                subscription.element_instance_key,
                &subscription.message_name,
                now,
            );
            resent += 1;
            debug!(
                element_instance_key = subscription.element_instance_key,
                message_name = %subscription.message_name,
                phase = subscription.phase.as_str(),
                subscription_partition_id = target,
                "Resent pending subscription command"
            );
        }

        if resent > 0 {
            let partition_id = state.partition_id();
            info!(
                partition_id,
                resent, "Resent pending workflow instance subscription commands"
            );
        }
        resent
    }
}
