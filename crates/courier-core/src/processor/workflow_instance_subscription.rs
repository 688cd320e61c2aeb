// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catching-side subscription commands.

use tracing::{debug, info};

use crate::error::RejectionType;
use crate::key::NO_KEY;
use crate::processor::ProcessingContext;
use crate::record::{
    Command, WorkflowInstanceIntent, WorkflowInstanceRecord, WorkflowInstanceSubscriptionIntent,
    WorkflowInstanceSubscriptionRecord,
};
use crate::state::WorkflowInstanceSubscriptionPhase;

/// The message side acknowledged an open.
pub fn open(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &WorkflowInstanceSubscriptionRecord,
) {
    let phase = ctx
        .state
        .workflow_instance_subscriptions
        .get(record.element_instance_key, &record.message_name)
        .map(|subscription| subscription.phase);

    match phase {
        None => ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to open workflow instance subscription with element key '{}' and message name '{}', but no such subscription was found",
                record.element_instance_key, record.message_name
            ),
        ),
        Some(WorkflowInstanceSubscriptionPhase::Opening) => {
            ctx.state
                .workflow_instance_subscriptions
                .update_to_opened(record.element_instance_key, &record.message_name);
            ctx.writer.append_follow_up_event(
                command.key,
                WorkflowInstanceSubscriptionIntent::Opened,
                record.clone(),
            );
        }
        Some(phase) => ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected to open workflow instance subscription with element key '{}' and message name '{}', but it is already {}",
                record.element_instance_key,
                record.message_name,
                phase.as_str()
            ),
        ),
    }
}

/// The message side correlated a message to this subscription.
///
/// Every failure path also sends a reject back so the message side can
/// release its correlation marker.
pub fn correlate(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &WorkflowInstanceSubscriptionRecord,
) {
    let Some(subscription) = ctx
        .state
        .workflow_instance_subscriptions
        .get(record.element_instance_key, &record.message_name)
        .cloned()
    else {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to correlate workflow instance subscription with element key '{}' and message name '{}', but no such subscription was found",
                record.element_instance_key, record.message_name
            ),
        );
        reject_correlation(ctx, record);
        return;
    };

    if subscription.phase == WorkflowInstanceSubscriptionPhase::Closing {
        ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected to correlate workflow instance subscription with element key '{}' and message name '{}', but it is already closing",
                record.element_instance_key, record.message_name
            ),
        );
        reject_correlation(ctx, record);
        return;
    }

    let triggered = ctx.event_scope.trigger_event(
        record.element_instance_key,
        record.message_key,
        &subscription.handler_node_id,
        &record.variables,
    );
    if !triggered {
        ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected to correlate workflow instance subscription with element key '{}' and message name '{}', but the event scope does not accept the message",
                record.element_instance_key, record.message_name
            ),
        );
        reject_correlation(ctx, record);
        return;
    }

    if subscription.close_on_correlate {
        ctx.state
            .workflow_instance_subscriptions
            .remove(record.element_instance_key, &record.message_name);
    }

    ctx.writer.append_follow_up_event(
        command.key,
        WorkflowInstanceSubscriptionIntent::Correlated,
        record.clone(),
    );
    ctx.writer.append_new_event(
        record.element_instance_key,
        WorkflowInstanceIntent::EventOccurred,
        WorkflowInstanceRecord {
            bpmn_process_id: subscription.bpmn_process_id.clone(),
            workflow_key: NO_KEY,
            workflow_instance_key: record.workflow_instance_key,
            element_id: subscription.handler_node_id.clone(),
            message_key: record.message_key,
            variables: record.variables.clone(),
        },
    );

    info!(
        message_key = record.message_key,
        workflow_instance_key = record.workflow_instance_key,
        element_instance_key = record.element_instance_key,
        message_name = %record.message_name,
        "Message correlated"
    );

    let ack = record.to_message_subscription_record();
    let partition_id = record.subscription_partition_id;
    let sender = ctx.sender.clone();
    ctx.side_effects
        .push("correlate_message_subscription", move || {
            sender.correlate_message_subscription(partition_id, ack)
        });
}

/// The message side acknowledged a close.
pub fn close(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &WorkflowInstanceSubscriptionRecord,
) {
    let removed = ctx
        .state
        .workflow_instance_subscriptions
        .remove(record.element_instance_key, &record.message_name);

    if removed.is_some() {
        ctx.writer.append_follow_up_event(
            command.key,
            WorkflowInstanceSubscriptionIntent::Closed,
            record.clone(),
        );
    } else {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to close workflow instance subscription with element key '{}' and message name '{}', but no such subscription was found",
                record.element_instance_key, record.message_name
            ),
        );
    }
}

fn reject_correlation(ctx: &mut ProcessingContext<'_>, record: &WorkflowInstanceSubscriptionRecord) {
    debug!(
        message_key = record.message_key,
        element_instance_key = record.element_instance_key,
        "Rejecting correlation back to message partition"
    );
    let rejected = record.to_message_subscription_record();
    let partition_id = record.subscription_partition_id;
    let sender = ctx.sender.clone();
    ctx.side_effects
        .push("reject_correlate_message_subscription", move || {
            sender.reject_correlate_message_subscription(partition_id, rejected)
        });
}
