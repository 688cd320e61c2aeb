// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catch events entering and leaving, as reported by the execution engine.
//!
//! Entering a catch event creates an opening subscription and asks the
//! message partition to open its side. Leaving moves every subscription of the
//! element to closing and asks the message partition to drop its side.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Rejection;
use crate::key::{Key, subscription_partition_id};
use crate::processor::ProcessingContext;
use crate::record::MessageSubscriptionRecord;
use crate::state::{WorkflowInstanceSubscription, WorkflowInstanceSubscriptionPhase};

/// A catch event waiting for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEventSubscription {
    /// Workflow instance of the catch event.
    pub workflow_instance_key: Key,
    /// Catch event element instance.
    pub element_instance_key: Key,
    /// Process of the workflow instance.
    pub bpmn_process_id: String,
    /// Element id triggered when the message arrives.
    pub element_id: String,
    /// Message name.
    pub message_name: String,
    /// Correlation key.
    pub correlation_key: String,
    /// Interrupting catch events stop listening after one message.
    pub close_on_correlate: bool,
}

/// Open a subscription for a catch event.
pub fn subscribe(
    ctx: &mut ProcessingContext<'_>,
    catch_event: &CatchEventSubscription,
) -> Result<(), Rejection> {
    if let Some(existing) = ctx
        .state
        .workflow_instance_subscriptions
        .get(catch_event.element_instance_key, &catch_event.message_name)
    {
        let reason = if existing.phase == WorkflowInstanceSubscriptionPhase::Closing {
            format!(
                "Expected to open subscription for element with key '{}' and message name '{}', but the previous subscription is still closing",
                catch_event.element_instance_key, catch_event.message_name
            )
        } else {
            format!(
                "Expected to open subscription for element with key '{}' and message name '{}', but it is already {}",
                catch_event.element_instance_key,
                catch_event.message_name,
                existing.phase.as_str()
            )
        };
        return Err(Rejection::invalid_state(reason));
    }

    let subscription = WorkflowInstanceSubscription {
        workflow_instance_key: catch_event.workflow_instance_key,
        element_instance_key: catch_event.element_instance_key,
        bpmn_process_id: catch_event.bpmn_process_id.clone(),
        message_name: catch_event.message_name.clone(),
        correlation_key: catch_event.correlation_key.clone(),
        subscription_partition_id: subscription_partition_id(
            &catch_event.correlation_key,
            ctx.partition_count,
        ),
        handler_node_id: catch_event.element_id.clone(),
        close_on_correlate: catch_event.close_on_correlate,
        phase: WorkflowInstanceSubscriptionPhase::Opening,
        sent_time: ctx.now,
    };

    debug!(
        element_instance_key = subscription.element_instance_key,
        message_name = %subscription.message_name,
        subscription_partition_id = subscription.subscription_partition_id,
        "Opening message subscription"
    );

    let partition_id = subscription.subscription_partition_id;
    let record = message_subscription_record(&subscription);
    ctx.state.workflow_instance_subscriptions.put(subscription);

    let sender = ctx.sender.clone();
    ctx.side_effects.push("open_message_subscription", move || {
        sender.open_message_subscription(partition_id, record)
    });
    Ok(())
}

/// Close every open subscription of an element instance.
///
/// Returns how many subscriptions moved to closing.
pub fn unsubscribe(ctx: &mut ProcessingContext<'_>, element_instance_key: Key) -> usize {
    let mut to_close = Vec::new();
    ctx.state
        .workflow_instance_subscriptions
        .visit_element_subscriptions(element_instance_key, |subscription| {
            if subscription.phase != WorkflowInstanceSubscriptionPhase::Closing {
                to_close.push(subscription.clone());
            }
            true
        });

    for subscription in &to_close {
        ctx.state.workflow_instance_subscriptions.update_to_closing(
            element_instance_key,
            &subscription.message_name,
            ctx.now,
        );

        let partition_id = subscription.subscription_partition_id;
        let record = message_subscription_record(subscription);
        let sender = ctx.sender.clone();
        ctx.side_effects.push("close_message_subscription", move || {
            sender.close_message_subscription(partition_id, record)
        });
    }

    to_close.len()
}

pub(crate) fn message_subscription_record(
    subscription: &WorkflowInstanceSubscription,
) -> MessageSubscriptionRecord {
    subscription
        .to_record(crate::key::NO_KEY, serde_json::Value::Null)
        .to_message_subscription_record()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionType;
    use crate::key::encode_partition_id;
    use crate::processor::test_support::Harness;
    use crate::record::{CommandBody, MessageSubscriptionIntent};

    fn catch_event(message_name: &str) -> CatchEventSubscription {
        CatchEventSubscription {
            workflow_instance_key: encode_partition_id(1, 1),
            element_instance_key: encode_partition_id(1, 2),
            bpmn_process_id: "order".to_string(),
            element_id: "wait".to_string(),
            message_name: message_name.to_string(),
            correlation_key: "order-1".to_string(),
            close_on_correlate: true,
        }
    }

    #[test]
    fn test_subscribe_opens_and_sends() {
        let mut harness = Harness::new(1);
        harness.partition_count = 3;
        let event = catch_event("payment");

        subscribe(&mut harness.context(), &event).unwrap();
        harness.run_side_effects();

        let subscription = harness
            .state
            .workflow_instance_subscriptions
            .get(event.element_instance_key, "payment")
            .unwrap();
        assert_eq!(subscription.phase, WorkflowInstanceSubscriptionPhase::Opening);
        assert_eq!(subscription.sent_time, harness.now);

        let sent = harness.queue.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, subscription_partition_id("order-1", 3));
        let CommandBody::OpenMessageSubscription(record) = &sent[0].1.body else {
            panic!("unexpected command {:?}", sent[0]);
        };
        assert_eq!(record.workflow_instance_key, event.workflow_instance_key);
        assert!(record.close_on_correlate);
    }

    #[test]
    fn test_second_subscribe_is_invalid_state() {
        let mut harness = Harness::new(1);
        let event = catch_event("payment");
        subscribe(&mut harness.context(), &event).unwrap();

        let rejection = subscribe(&mut harness.context(), &event).unwrap_err();
        assert_eq!(rejection.kind, RejectionType::InvalidState);
        assert!(rejection.reason.contains("opening"));

        unsubscribe(&mut harness.context(), event.element_instance_key);
        let rejection = subscribe(&mut harness.context(), &event).unwrap_err();
        assert!(rejection.reason.contains("still closing"));
    }

    #[test]
    fn test_unsubscribe_closes_each_subscription_once() {
        let mut harness = Harness::new(1);
        let payment = catch_event("payment");
        let cancel = catch_event("cancel");
        subscribe(&mut harness.context(), &payment).unwrap();
        subscribe(&mut harness.context(), &cancel).unwrap();
        harness.run_side_effects();
        harness.sent();

        assert_eq!(unsubscribe(&mut harness.context(), payment.element_instance_key), 2);
        harness.run_side_effects();
        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|c| c.intent() == MessageSubscriptionIntent::Close.into()));

        assert_eq!(unsubscribe(&mut harness.context(), payment.element_instance_key), 0);
    }
}
