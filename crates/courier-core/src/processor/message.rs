// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::correlator::begin_correlation;
use crate::error::{CoreError, RejectionType, Result};
use crate::key::Key;
use crate::processor::ProcessingContext;
use crate::record::{
    Command, MessageIntent, MessageRecord, MessageStartEventSubscriptionRecord,
    WorkflowInstanceIntent, WorkflowInstanceRecord,
};
use crate::state::{MessageSubscription, PartitionState, StoredMessage};

/// Publish a message and correlate it to waiting subscriptions and start events.
///
/// Every start event scope is asked whether it accepts the trigger before any
/// trigger fires, so a refusal leaves the partition and the execution engine
/// as they were.
pub fn publish(
    ctx: &mut ProcessingContext<'_>,
    command: &Command,
    message: &MessageRecord,
) -> Result<()> {
    if message.has_message_id()
        && ctx
            .state
            .messages
            .exist(&message.name, &message.correlation_key, &message.message_id)
    {
        ctx.reject(
            command,
            RejectionType::AlreadyExists,
            format!(
                "Expected to publish a new message with id '{}', but a message with that id was already published",
                message.message_id
            ),
        );
        return Ok(());
    }

    let message_key = ctx.state.next_key();
    let subscriptions = subscriptions_to_correlate(ctx.state, message);
    let start_events = start_events_to_trigger(ctx.state, message);

    if let Some(refused) = start_events
        .iter()
        .find(|start_event| !ctx.event_scope.accepts_trigger(start_event.workflow_key))
    {
        return Err(CoreError::StartEventNotTriggered {
            workflow_key: refused.workflow_key,
            element_id: refused.start_event_id.clone(),
        });
    }

    let mut started: Vec<(MessageStartEventSubscriptionRecord, Key)> =
        Vec::with_capacity(start_events.len());
    for start_event in start_events {
        let workflow_instance_key = ctx.state.next_key();
        let triggered = ctx.event_scope.trigger_event(
            start_event.workflow_key,
            workflow_instance_key,
            &start_event.start_event_id,
            &message.variables,
        );
        if !triggered {
            // Earlier start events already fired and must be recorded.
            warn!(
                message_key,
                workflow_key = start_event.workflow_key,
                start_event_id = %start_event.start_event_id,
                "Start event refused trigger after accepting it"
            );
            continue;
        }
        started.push((start_event, workflow_instance_key));
    }

    ctx.writer
        .append_follow_up_event(message_key, MessageIntent::Published, message.clone());
    ctx.response
        .write_event(message_key, MessageIntent::Published, message.clone());

    for subscription in &subscriptions {
        begin_correlation(ctx, subscription, message_key, message.variables.clone());
    }

    for (start_event, workflow_instance_key) in &started {
        ctx.writer.append_new_event(
            *workflow_instance_key,
            WorkflowInstanceIntent::EventOccurred,
            WorkflowInstanceRecord {
                bpmn_process_id: start_event.bpmn_process_id.clone(),
                workflow_key: start_event.workflow_key,
                workflow_instance_key: *workflow_instance_key,
                element_id: start_event.start_event_id.clone(),
                message_key,
                variables: message.variables.clone(),
            },
        );
        if !message.correlation_key.is_empty() {
            ctx.state.messages.lock_correlation_key(
                &start_event.bpmn_process_id,
                &message.correlation_key,
                *workflow_instance_key,
            );
        }
        info!(
            message_key,
            workflow_key = start_event.workflow_key,
            workflow_instance_key = *workflow_instance_key,
            start_event_id = %start_event.start_event_id,
            "Message triggered start event"
        );
    }

    if message.time_to_live > 0 {
        ctx.state.messages.put(StoredMessage {
            key: message_key,
            message: message.clone(),
            deadline: ctx.now.saturating_add(message.time_to_live),
        });
        for subscription in &subscriptions {
            ctx.state
                .messages
                .put_message_correlation(message_key, subscription.workflow_instance_key);
        }
        for (start_event, workflow_instance_key) in &started {
            ctx.state
                .messages
                .put_process_correlation(message_key, &start_event.bpmn_process_id);
            ctx.state
                .messages
                .put_message_correlation(message_key, *workflow_instance_key);
        }
    } else {
        ctx.writer
            .append_follow_up_event(message_key, MessageIntent::Deleted, message.clone());
    }

    debug!(
        message_key,
        name = %message.name,
        correlation_key = %message.correlation_key,
        correlated_subscriptions = subscriptions.len(),
        started_instances = started.len(),
        "Message published"
    );

    Ok(())
}

/// Delete a stored message (TTL expiry or explicit delete).
pub fn delete(ctx: &mut ProcessingContext<'_>, command: &Command) {
    let Some(stored) = ctx.state.messages.remove(command.key) else {
        ctx.reject(
            command,
            RejectionType::NotFound,
            format!(
                "Expected to delete message with key '{}', but no such message was found",
                command.key
            ),
        );
        return;
    };

    ctx.writer
        .append_follow_up_event(command.key, MessageIntent::Deleted, stored.message.clone());
    ctx.response
        .write_event(command.key, MessageIntent::Deleted, stored.message);
}

/// Open subscriptions on the message, at most one per workflow instance.
fn subscriptions_to_correlate(
    state: &PartitionState,
    message: &MessageRecord,
) -> Vec<MessageSubscription> {
    let mut instances = HashSet::new();
    let mut matched = Vec::new();
    state.message_subscriptions.visit_subscriptions(
        &message.name,
        &message.correlation_key,
        |subscription| {
            if !subscription.is_correlating()
                && instances.insert(subscription.workflow_instance_key)
            {
                matched.push(subscription.clone());
            }
            true
        },
    );
    matched
}

/// Start events the message triggers, at most one per process.
fn start_events_to_trigger(
    state: &PartitionState,
    message: &MessageRecord,
) -> Vec<MessageStartEventSubscriptionRecord> {
    let mut processes = HashSet::new();
    let mut matched = Vec::new();
    state
        .start_event_subscriptions
        .visit_subscriptions_by_message_name(&message.name, |subscription| {
            if processes.contains(&subscription.bpmn_process_id) {
                return true;
            }
            if !message.correlation_key.is_empty()
                && state
                    .messages
                    .is_correlation_key_locked(&subscription.bpmn_process_id, &message.correlation_key)
            {
                return true;
            }
            processes.insert(subscription.bpmn_process_id.clone());
            matched.push(subscription.clone());
            true
        });
    matched
}
