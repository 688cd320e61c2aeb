// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message time-to-live and message id uniqueness.

mod common;

use std::time::Duration;

use common::{TestCluster, catch_event, instance_key, message};
use courier_core::RejectionType;
use courier_core::record::{Command, CommandBody, MessageIntent, MessageRecord};
use serde_json::json;

#[test]
fn test_zero_ttl_message_is_deleted_right_away() {
    let mut cluster = TestCluster::new(3);
    let response = cluster.publish(message("payment", "order-1", 0, json!({})));
    assert!(!response.is_rejected());

    let partition_id = cluster.message_partition("order-1");
    let records = cluster.records(partition_id);
    let published = records
        .iter()
        .position(|r| r.is_event(MessageIntent::Published))
        .unwrap();
    let deleted = records
        .iter()
        .position(|r| r.is_event(MessageIntent::Deleted) && r.key == response.key)
        .unwrap();
    assert!(published < deleted);
    assert!(cluster.partition(partition_id).state().messages.is_empty());
}

#[test]
fn test_zero_ttl_message_still_correlates_to_open_subscription() {
    let mut cluster = TestCluster::new(3);
    let eik = instance_key(1, 2);
    let subscription = catch_event(&cluster, instance_key(1, 1), eik, "payment", "order-1");
    cluster.subscribe(&subscription).unwrap();
    cluster.deliver_all();

    let response = cluster.publish(message("payment", "order-1", 0, json!({"late": false})));
    cluster.deliver_all();

    let triggers = cluster.scopes.triggers_of(eik);
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].event_key, response.key);
}

#[test]
fn test_expired_message_is_skipped_before_sweep() {
    let mut cluster = TestCluster::new(3);
    cluster.publish(message("payment", "order-1", 1_000, json!({})));
    cluster.advance(Duration::from_millis(1_000));

    let eik = instance_key(1, 2);
    let subscription = catch_event(&cluster, instance_key(1, 1), eik, "payment", "order-1");
    cluster.subscribe(&subscription).unwrap();
    cluster.deliver_all();

    assert!(cluster.scopes.triggers_of(eik).is_empty());
    let partition_id = cluster.message_partition("order-1");
    assert_eq!(cluster.partition(partition_id).state().messages.len(), 1);
}

#[test]
fn test_sweep_deletes_expired_messages_only() {
    let mut cluster = TestCluster::new(3);
    let short = cluster.publish(message("payment", "order-1", 1_000, json!({})));
    let long = cluster.publish(message("payment", "order-1", 60_000, json!({})));

    assert_eq!(cluster.check_ttl(), 0);
    cluster.advance(Duration::from_secs(5));
    assert_eq!(cluster.check_ttl(), 1);

    let partition_id = cluster.message_partition("order-1");
    let messages = &cluster.partition(partition_id).state().messages;
    assert!(messages.get(short.key).is_none());
    assert!(messages.get(long.key).is_some());
    assert!(
        cluster
            .records(partition_id)
            .iter()
            .any(|r| r.is_event(MessageIntent::Deleted) && r.key == short.key)
    );
}

#[test]
fn test_duplicate_message_id_is_rejected_until_deleted() {
    let mut cluster = TestCluster::new(3);
    let message_id = uuid::Uuid::new_v4().to_string();
    let with_id = |correlation_key: &str| {
        message("payment", correlation_key, 1_000, json!({})).with_message_id(message_id.clone())
    };

    let first = cluster.publish(with_id("order-1"));
    assert!(!first.is_rejected());

    let duplicate = cluster.publish(with_id("order-1"));
    let rejection = duplicate.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionType::AlreadyExists);
    assert!(rejection.reason.contains(&message_id));

    // Same id under another correlation key is a different message.
    let other = cluster.publish(with_id("order-2"));
    assert!(!other.is_rejected());

    cluster.advance(Duration::from_secs(2));
    assert!(cluster.check_ttl() >= 1);

    let reused = cluster.publish(with_id("order-1"));
    assert!(!reused.is_rejected());
    assert_ne!(reused.key, first.key);
}

#[test]
fn test_deleting_unknown_message_is_rejected() {
    let mut cluster = TestCluster::new(1);
    let outcome = cluster.submit(
        1,
        Command::new(
            12_345,
            CommandBody::DeleteMessage(MessageRecord::new("payment", "order-1")),
        ),
    );

    let rejection = outcome.response.unwrap().rejection.unwrap();
    assert_eq!(rejection.kind, RejectionType::NotFound);
}
