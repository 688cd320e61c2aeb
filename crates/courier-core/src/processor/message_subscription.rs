// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-side subscription commands.
//!
//! Each handler only acts when its precondition holds and otherwise writes a
//! rejection, so redelivered commands are absorbed without changing state.

use tracing::debug;

use crate::correlator::{begin_correlation, correlate_next_message};
use crate::error::RejectionType;
use crate::processor::ProcessingContext;
use crate::record::{
    Command, MessageSubscriptionIntent, MessageSubscriptionRecord,
    WorkflowInstanceSubscriptionRecord,
};
use crate::state::{MessageSubscription, MessageSubscriptionPhase};

/// Open a subscription and try to correlate a stored message right away.
pub fn open(ctx: &mut ProcessingContext<'_>, command: &Command, record: &MessageSubscriptionRecord) {
    if ctx
        .state
        .message_subscriptions
        .exist_subscription_for_element_instance(record.element_instance_key, &record.message_name)
    {
        ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected to open a new message subscription for element with key '{}' and message name '{}', but there is already a message subscription for that element key and message name opened",
                record.element_instance_key, record.message_name
            ),
        );
        acknowledge_open(ctx, record);
        return;
    }

    ctx.state
        .message_subscriptions
        .put(MessageSubscription::from_record(record));
    ctx.writer
        .append_follow_up_event(command.key, MessageSubscriptionIntent::Opened, record.clone());
    acknowledge_open(ctx, record);

    correlate_next_message(ctx, record.element_instance_key, &record.message_name);
}

/// The catching side acknowledged a correlation.
pub fn correlate(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &MessageSubscriptionRecord,
) {
    let Some(subscription) = ctx
        .state
        .message_subscriptions
        .get(record.element_instance_key, &record.message_name)
        .cloned()
    else {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to find subscription for element with key '{}' and message name '{}', but no such subscription was found",
                record.element_instance_key, record.message_name
            ),
        );
        return;
    };

    if let MessageSubscriptionPhase::Correlating { message_key, .. } = subscription.phase {
        if message_key != record.message_key {
            ctx.reject(
                command,
                RejectionType::InvalidState,
                format!(
                    "Expected subscription for element with key '{}' and message name '{}' to correlate message '{}', but it is correlating message '{}'",
                    record.element_instance_key, record.message_name, record.message_key, message_key
                ),
            );
            return;
        }
    }

    ctx.writer
        .append_follow_up_event(command.key, MessageSubscriptionIntent::Correlated, record.clone());

    if subscription.close_on_correlate {
        ctx.state
            .message_subscriptions
            .remove(record.element_instance_key, &record.message_name);
    } else {
        ctx.state
            .message_subscriptions
            .update_to_opened(record.element_instance_key, &record.message_name);
        correlate_next_message(ctx, record.element_instance_key, &record.message_name);
    }
}

/// Close a subscription. The acknowledgement is sent even when nothing was removed.
pub fn close(ctx: &mut ProcessingContext<'_>, command: &Command, record: &MessageSubscriptionRecord) {
    let removed = ctx
        .state
        .message_subscriptions
        .remove(record.element_instance_key, &record.message_name);

    if removed.is_some() {
        ctx.writer
            .append_follow_up_event(command.key, MessageSubscriptionIntent::Closed, record.clone());
    } else {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to close message subscription for element with key '{}' and message name '{}', but no such message subscription exists",
                record.element_instance_key, record.message_name
            ),
        );
    }

    let ack = ack_record(ctx, record);
    let sender = ctx.sender.clone();
    ctx.side_effects
        .push("close_workflow_instance_subscription", move || {
            sender.close_workflow_instance_subscription(ack)
        });
}

/// The catching side could not honour a correlation.
///
/// Releases the correlation marker and hands the message to another open
/// subscription of the same workflow instance, if there is one.
pub fn reject(ctx: &mut ProcessingContext<'_>, command: &Command, record: &MessageSubscriptionRecord) {
    let message_key = record.message_key;
    let workflow_instance_key = record.workflow_instance_key;

    if !ctx
        .state
        .messages
        .exist_message_correlation(message_key, workflow_instance_key)
    {
        ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected message '{}' to be correlated to workflow instance '{}', but no such correlation was found",
                message_key, workflow_instance_key
            ),
        );
        return;
    }

    ctx.state
        .messages
        .remove_message_correlation(message_key, workflow_instance_key);
    settle_rejected(ctx, record);

    let mut candidate: Option<MessageSubscription> = None;
    ctx.state.message_subscriptions.visit_subscriptions(
        &record.message_name,
        &record.correlation_key,
        |subscription| {
            if subscription.workflow_instance_key == workflow_instance_key
                && subscription.element_instance_key != record.element_instance_key
                && !subscription.is_correlating()
            {
                candidate = Some(subscription.clone());
                return false;
            }
            true
        },
    );

    if let Some(subscription) = candidate {
        debug!(
            message_key,
            workflow_instance_key,
            rejected_element_instance_key = record.element_instance_key,
            element_instance_key = subscription.element_instance_key,
            "Retrying rejected correlation on another subscription of the instance"
        );
        ctx.state
            .messages
            .put_message_correlation(message_key, workflow_instance_key);
        begin_correlation(ctx, &subscription, message_key, record.variables.clone());
    }

    ctx.writer
        .append_follow_up_event(command.key, MessageSubscriptionIntent::Rejected, record.clone());
}

/// Stop resending the rejected correlation. A subscription that closes on
/// correlate is dropped, since its catching side is gone or can no longer
/// take the message; any other goes back to waiting.
fn settle_rejected(ctx: &mut ProcessingContext<'_>, record: &MessageSubscriptionRecord) {
    let Some(subscription) = ctx
        .state
        .message_subscriptions
        .get(record.element_instance_key, &record.message_name)
    else {
        return;
    };
    let in_flight = matches!(
        subscription.phase,
        MessageSubscriptionPhase::Correlating { message_key, .. } if message_key == record.message_key
    );
    if !in_flight {
        return;
    }

    if subscription.close_on_correlate {
        ctx.state
            .message_subscriptions
            .remove(record.element_instance_key, &record.message_name);
    } else {
        ctx.state
            .message_subscriptions
            .update_to_opened(record.element_instance_key, &record.message_name);
    }
}

fn ack_record(
    ctx: &ProcessingContext<'_>,
    record: &MessageSubscriptionRecord,
) -> WorkflowInstanceSubscriptionRecord {
    record.to_workflow_instance_subscription_record(ctx.partition_id())
}

fn acknowledge_open(ctx: &mut ProcessingContext<'_>, record: &MessageSubscriptionRecord) {
    let ack = ack_record(ctx, record);
    let sender = ctx.sender.clone();
    ctx.side_effects
        .push("open_workflow_instance_subscription", move || {
            sender.open_workflow_instance_subscription(ack)
        });
}
