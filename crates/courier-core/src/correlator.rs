// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matches a message-side subscription with the next stored message.
//!
//! Candidates are visited in message key order, so the first published
//! message that is neither expired nor already correlated to the
//! subscription's workflow instance wins.

use serde_json::Value;
use tracing::debug;

use crate::key::Key;
use crate::processor::ProcessingContext;
use crate::state::MessageSubscription;

/// Correlate the subscription `(element_instance_key, message_name)` to the
/// next eligible stored message.
///
/// Returns `true` if the subscription moved to correlating. Otherwise it stays
/// as it is until the next publish or acknowledgement.
pub fn correlate_next_message(
    ctx: &mut ProcessingContext<'_>,
    element_instance_key: Key,
    message_name: &str,
) -> bool {
    let Some(subscription) = ctx
        .state
        .message_subscriptions
        .get(element_instance_key, message_name)
        .cloned()
    else {
        return false;
    };

    let now = ctx.now;
    let messages = &ctx.state.messages;
    let mut next: Option<(Key, Value)> = None;
    messages.visit_messages(
        &subscription.message_name,
        &subscription.correlation_key,
        |stored| {
            if stored.is_expired(now)
                || messages
                    .exist_message_correlation(stored.key, subscription.workflow_instance_key)
            {
                return true;
            }
            next = Some((stored.key, stored.message.variables.clone()));
            false
        },
    );

    let Some((message_key, variables)) = next else {
        return false;
    };

    ctx.state
        .messages
        .put_message_correlation(message_key, subscription.workflow_instance_key);
    begin_correlation(ctx, &subscription, message_key, variables);
    true
}

/// Move `subscription` to correlating with the given message and register the
/// correlate command toward the catching partition.
///
/// Correlation markers are the caller's business.
pub(crate) fn begin_correlation(
    ctx: &mut ProcessingContext<'_>,
    subscription: &MessageSubscription,
    message_key: Key,
    variables: Value,
) {
    ctx.state.message_subscriptions.update_to_correlating(
        subscription.element_instance_key,
        &subscription.message_name,
        message_key,
        variables.clone(),
        ctx.now,
    );

    let mut record = subscription.to_record();
    record.message_key = message_key;
    record.variables = variables;
    let record = record.to_workflow_instance_subscription_record(ctx.partition_id());

    debug!(
        message_key,
        workflow_instance_key = subscription.workflow_instance_key,
        element_instance_key = subscription.element_instance_key,
        message_name = %subscription.message_name,
        "Correlating message to subscription"
    );

    let sender = ctx.sender.clone();
    ctx.side_effects
        .push("correlate_workflow_instance_subscription", move || {
            sender.correlate_workflow_instance_subscription(record)
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::Harness;
    use crate::record::{CommandBody, MessageRecord};
    use crate::state::{MessageSubscriptionPhase, StoredMessage};
    use serde_json::json;

    fn store(harness: &mut Harness, key: Key, deadline: i64, variables: Value) {
        harness.state.messages.put(StoredMessage {
            key,
            message: MessageRecord::new("payment", "order-1")
                .with_time_to_live(10_000)
                .with_variables(variables),
            deadline,
        });
    }

    fn open_subscription(harness: &mut Harness, element_instance_key: Key) {
        harness.state.message_subscriptions.put(MessageSubscription {
            workflow_instance_key: 100,
            element_instance_key,
            bpmn_process_id: "process".to_string(),
            message_name: "payment".to_string(),
            correlation_key: "order-1".to_string(),
            close_on_correlate: true,
            phase: MessageSubscriptionPhase::Opened,
        });
    }

    fn correlate(harness: &mut Harness, element_instance_key: Key) -> bool {
        let correlated =
            correlate_next_message(&mut harness.context(), element_instance_key, "payment");
        harness.run_side_effects();
        correlated
    }

    #[test]
    fn test_first_published_message_wins() {
        let mut harness = Harness::new(1);
        store(&mut harness, 7, 50_000, json!({"n": 7}));
        store(&mut harness, 5, 50_000, json!({"n": 5}));
        open_subscription(&mut harness, 10);

        assert!(correlate(&mut harness, 10));

        let subscription = harness.state.message_subscriptions.get(10, "payment").unwrap();
        assert!(matches!(
            subscription.phase,
            MessageSubscriptionPhase::Correlating { message_key: 5, .. }
        ));
        assert!(harness.state.messages.exist_message_correlation(5, 100));

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        let CommandBody::CorrelateWorkflowInstanceSubscription(record) = &sent[0].body else {
            panic!("unexpected command {:?}", sent[0]);
        };
        assert_eq!(record.message_key, 5);
        assert_eq!(record.variables, json!({"n": 5}));
        assert_eq!(record.subscription_partition_id, 1);
    }

    #[test]
    fn test_skips_messages_already_correlated_to_instance() {
        let mut harness = Harness::new(1);
        store(&mut harness, 5, 50_000, Value::Null);
        store(&mut harness, 7, 50_000, Value::Null);
        harness.state.messages.put_message_correlation(5, 100);
        open_subscription(&mut harness, 10);

        assert!(correlate(&mut harness, 10));
        assert!(harness.state.messages.exist_message_correlation(7, 100));
    }

    #[test]
    fn test_skips_expired_messages() {
        let mut harness = Harness::new(1);
        let now = harness.now;
        store(&mut harness, 5, now, Value::Null);
        open_subscription(&mut harness, 10);

        assert!(!correlate(&mut harness, 10));
        assert!(!harness.state.message_subscriptions.get(10, "payment").unwrap().is_correlating());
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn test_missing_subscription_does_nothing() {
        let mut harness = Harness::new(1);
        store(&mut harness, 5, 50_000, Value::Null);
        assert!(!correlate(&mut harness, 10));
        assert!(!harness.state.messages.exist_message_correlation(5, 100));
    }
}
