// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drains messages buffered behind a correlation-key lock.
//!
//! While an instance started by a message start event is running, further
//! messages with the same correlation key stay in the store. When that
//! instance finishes, the next buffered message (lowest message key, across
//! every start event of the process) starts the following instance, which
//! takes over the lock.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::key::Key;
use crate::processor::ProcessingContext;
use crate::record::{MessageStartEventSubscriptionRecord, WorkflowInstanceIntent, WorkflowInstanceRecord};

/// Run after `finished` reached a terminal state.
///
/// Returns the key of the instance started from a buffered message, if any.
/// A refused trigger fails before the lock is released or anything is
/// appended.
pub fn correlate_buffered_message(
    ctx: &mut ProcessingContext<'_>,
    finished: &WorkflowInstanceRecord,
) -> Result<Option<Key>> {
    let Some(correlation_key) = ctx
        .state
        .messages
        .correlation_key_of_instance(finished.workflow_instance_key)
        .map(str::to_owned)
    else {
        return Ok(None);
    };

    let Some((start_event, message_key, variables)) =
        next_buffered_message(ctx, &finished.bpmn_process_id, &correlation_key)
    else {
        ctx.state
            .messages
            .release_correlation_key(&finished.bpmn_process_id, finished.workflow_instance_key);
        debug!(
            workflow_instance_key = finished.workflow_instance_key,
            correlation_key = %correlation_key,
            "Released correlation key, no buffered message"
        );
        return Ok(None);
    };

    let workflow_instance_key = ctx.state.next_key();
    if !ctx.event_scope.trigger_event(
        start_event.workflow_key,
        workflow_instance_key,
        &start_event.start_event_id,
        &variables,
    ) {
        return Err(CoreError::StartEventNotTriggered {
            workflow_key: start_event.workflow_key,
            element_id: start_event.start_event_id,
        });
    }

    ctx.state
        .messages
        .release_correlation_key(&finished.bpmn_process_id, finished.workflow_instance_key);
    ctx.writer.append_new_event(
        workflow_instance_key,
        WorkflowInstanceIntent::EventOccurred,
        WorkflowInstanceRecord {
            bpmn_process_id: start_event.bpmn_process_id.clone(),
            workflow_key: start_event.workflow_key,
            workflow_instance_key,
            element_id: start_event.start_event_id.clone(),
            message_key,
            variables,
        },
    );
    ctx.state
        .messages
        .put_process_correlation(message_key, &start_event.bpmn_process_id);
    ctx.state
        .messages
        .put_message_correlation(message_key, workflow_instance_key);
    ctx.state.messages.lock_correlation_key(
        &start_event.bpmn_process_id,
        &correlation_key,
        workflow_instance_key,
    );

    info!(
        message_key,
        previous_instance_key = finished.workflow_instance_key,
        workflow_instance_key,
        correlation_key = %correlation_key,
        "Buffered message started next instance"
    );
    Ok(Some(workflow_instance_key))
}

fn next_buffered_message(
    ctx: &ProcessingContext<'_>,
    bpmn_process_id: &str,
    correlation_key: &str,
) -> Option<(MessageStartEventSubscriptionRecord, Key, Value)> {
    let messages = &ctx.state.messages;
    let mut best: Option<(MessageStartEventSubscriptionRecord, Key, Value)> = None;

    for start_event in ctx
        .state
        .start_event_subscriptions
        .subscriptions_for_process(bpmn_process_id)
    {
        let mut candidate = None;
        messages.visit_messages(&start_event.message_name, correlation_key, |stored| {
            if stored.is_expired(ctx.now)
                || messages.exist_process_correlation(stored.key, bpmn_process_id)
            {
                return true;
            }
            candidate = Some((stored.key, stored.message.variables.clone()));
            false
        });

        if let Some((message_key, variables)) = candidate {
            if best.as_ref().is_none_or(|(_, best_key, _)| message_key < *best_key) {
                best = Some((start_event, message_key, variables));
            }
        }
    }

    best
}
