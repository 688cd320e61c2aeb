// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use tracing::debug;

use crate::error::RejectionType;
use crate::processor::ProcessingContext;
use crate::record::{Command, MessageStartEventSubscriptionIntent, MessageStartEventSubscriptionRecord};

/// Open a start event subscription for a deployed workflow.
///
/// Subscriptions of other workflow keys of the same process are closed first,
/// so only the latest deployed version listens for messages.
pub fn open(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &MessageStartEventSubscriptionRecord,
) {
    if ctx
        .state
        .start_event_subscriptions
        .exists(&record.message_name, record.workflow_key)
    {
        ctx.reject(
            command,
            RejectionType::InvalidState,
            format!(
                "Expected to open a message start event subscription for workflow '{}' and message name '{}', but it is already open",
                record.workflow_key, record.message_name
            ),
        );
        return;
    }

    let previous_versions: Vec<_> = ctx
        .state
        .start_event_subscriptions
        .workflow_keys_of_process(&record.bpmn_process_id)
        .into_iter()
        .filter(|workflow_key| *workflow_key != record.workflow_key)
        .collect();
    for workflow_key in previous_versions {
        for closed in ctx
            .state
            .start_event_subscriptions
            .remove_subscriptions_of_workflow(workflow_key)
        {
            debug!(
                workflow_key,
                bpmn_process_id = %closed.bpmn_process_id,
                "Closed start event subscription of previous version"
            );
            ctx.writer.append_follow_up_event(
                command.key,
                MessageStartEventSubscriptionIntent::Closed,
                closed,
            );
        }
    }

    ctx.state.start_event_subscriptions.put(record.clone());
    ctx.writer.append_follow_up_event(
        command.key,
        MessageStartEventSubscriptionIntent::Opened,
        record.clone(),
    );
    ctx.response.write_event(
        command.key,
        MessageStartEventSubscriptionIntent::Opened,
        record.clone(),
    );
}

/// Close every start event subscription of a workflow.
pub fn close(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    record: &MessageStartEventSubscriptionRecord,
) {
    let removed = ctx
        .state
        .start_event_subscriptions
        .remove_subscriptions_of_workflow(record.workflow_key);

    if removed.is_empty() {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to close message start event subscriptions of workflow '{}', but none are open",
                record.workflow_key
            ),
        );
        return;
    }

    for subscription in removed {
        ctx.writer.append_follow_up_event(
            command.key,
            MessageStartEventSubscriptionIntent::Closed,
            subscription,
        );
    }
    ctx.response.write_event(
        command.key,
        MessageStartEventSubscriptionIntent::Closed,
        record.clone(),
    );
}
