// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for courier-core integration tests.
//!
//! Provides a deterministic in-process cluster: partitions are driven by the
//! test, cross-partition commands wait in a shared queue until delivered, and
//! time only moves when the test advances the clock.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use serde_json::Value;

use courier_core::clock::ControlledClock;
use courier_core::command_sender::QueuedCommandSender;
use courier_core::config::Config;
use courier_core::error::{Rejection, Result};
use courier_core::event_scope::EventScopeRegistry;
use courier_core::key::{Key, PartitionId, START_PARTITION_ID, encode_partition_id, subscription_partition_id};
use courier_core::partition::{Partition, ProcessingOutcome};
use courier_core::processor::catch_event::CatchEventSubscription;
use courier_core::record::{
    Command, CommandBody, CommandResponse, MessageRecord, MessageStartEventSubscriptionRecord,
    Record, WorkflowInstanceRecord,
};

/// Start of the test clock, epoch milliseconds.
pub const START_TIME: i64 = 1_700_000_000_000;

/// Subscription timeout used by the cluster.
pub const SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Initialise tracing once per test binary, honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Partitions driven step by step by the test.
pub struct TestCluster {
    pub partitions: BTreeMap<PartitionId, Partition>,
    pub queue: QueuedCommandSender,
    pub scopes: EventScopeRegistry,
    pub clock: ControlledClock,
    pub config: Config,
}

impl TestCluster {
    /// Cluster with `partition_count` empty partitions.
    pub fn new(partition_count: u32) -> Self {
        init_tracing();

        let queue = QueuedCommandSender::new();
        let scopes = EventScopeRegistry::new();
        let clock = ControlledClock::new(START_TIME);
        let config = Config {
            partition_count,
            subscription_timeout: SUBSCRIPTION_TIMEOUT,
            ..Config::default()
        };

        let partitions = (0..partition_count)
            .map(|offset| {
                let partition_id = START_PARTITION_ID + offset as PartitionId;
                let partition = Partition::new(
                    partition_id,
                    &config,
                    Arc::new(queue.clone()),
                    Arc::new(scopes.clone()),
                    Arc::new(clock.clone()),
                );
                (partition_id, partition)
            })
            .collect();

        Self {
            partitions,
            queue,
            scopes,
            clock,
            config,
        }
    }

    pub fn partition(&self, partition_id: PartitionId) -> &Partition {
        &self.partitions[&partition_id]
    }

    fn partition_mut(&mut self, partition_id: PartitionId) -> &mut Partition {
        self.partitions
            .get_mut(&partition_id)
            .unwrap_or_else(|| panic!("no partition {partition_id}"))
    }

    /// Partition owning messages for `correlation_key`.
    pub fn message_partition(&self, correlation_key: &str) -> PartitionId {
        subscription_partition_id(correlation_key, self.config.partition_count)
    }

    /// Process a command and run its side effects.
    pub fn submit(&mut self, partition_id: PartitionId, command: Command) -> ProcessingOutcome {
        let mut outcome = self.partition_mut(partition_id).process(command);
        std::mem::take(&mut outcome.side_effects).execute();
        outcome
    }

    /// Publish a message on its partition and return the reply.
    pub fn publish(&mut self, message: MessageRecord) -> CommandResponse {
        let partition_id = self.message_partition(&message.correlation_key);
        self.submit(
            partition_id,
            Command::unkeyed(CommandBody::PublishMessage(message)),
        )
        .response
        .expect("publish always replies")
    }

    /// Open start event subscriptions on every partition.
    pub fn deploy(&mut self, subscriptions: &[MessageStartEventSubscriptionRecord]) {
        let ids: Vec<PartitionId> = self.partitions.keys().copied().collect();
        for partition_id in ids {
            for subscription in subscriptions {
                let response = self
                    .submit(
                        partition_id,
                        Command::unkeyed(CommandBody::OpenMessageStartEventSubscription(
                            subscription.clone(),
                        )),
                    )
                    .response
                    .expect("open always replies");
                assert!(!response.is_rejected(), "deploy rejected: {response:?}");
            }
        }
    }

    pub fn subscribe(&mut self, subscription: &CatchEventSubscription) -> std::result::Result<(), Rejection> {
        let partition_id = courier_core::key::decode_partition_id(subscription.workflow_instance_key);
        self.partition_mut(partition_id).subscribe(subscription)
    }

    pub fn unsubscribe(&mut self, partition_id: PartitionId, element_instance_key: Key) -> usize {
        self.partition_mut(partition_id)
            .unsubscribe(element_instance_key)
    }

    pub fn finish_instance(&mut self, instance: WorkflowInstanceRecord) -> Result<Option<Key>> {
        let partition_id = courier_core::key::decode_partition_id(instance.workflow_instance_key);
        self.partition_mut(partition_id)
            .workflow_instance_finished(instance, false)
    }

    /// Deliver the oldest queued command. Returns it, or `None` if the queue
    /// is empty.
    pub fn deliver_one(&mut self) -> Option<(PartitionId, Command)> {
        let (partition_id, command) = self.queue.pop()?;
        self.submit(partition_id, command.clone());
        Some((partition_id, command))
    }

    /// Deliver until the queue is empty. Returns how many commands were
    /// delivered.
    pub fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while self.deliver_one().is_some() {
            delivered += 1;
            assert!(delivered < 10_000, "command delivery does not converge");
        }
        delivered
    }

    /// Drop every queued command, as a lossy transport would.
    pub fn drop_queued(&mut self) -> Vec<(PartitionId, Command)> {
        self.queue.drain()
    }

    /// Move the clock forward.
    pub fn advance(&mut self, duration: Duration) {
        self.clock.advance_millis(duration.as_millis() as i64);
    }

    /// Run the pending checkers of every partition.
    pub fn check_pending(&mut self) -> usize {
        self.partitions
            .values_mut()
            .map(Partition::check_pending_subscriptions)
            .sum()
    }

    /// Run the TTL sweep of every partition.
    pub fn check_ttl(&mut self) -> usize {
        self.partitions
            .values_mut()
            .map(Partition::check_message_ttl)
            .sum()
    }

    pub fn records(&self, partition_id: PartitionId) -> &[Record] {
        self.partition(partition_id).records()
    }
}

/// Workflow instance key on a partition, well above anything a partition
/// generates in a test.
pub fn instance_key(partition_id: PartitionId, counter: i64) -> Key {
    encode_partition_id(partition_id, 1_000_000 + counter)
}

/// Catch event subscription with its element scope open.
pub fn catch_event(
    cluster: &TestCluster,
    workflow_instance_key: Key,
    element_instance_key: Key,
    message_name: &str,
    correlation_key: &str,
) -> CatchEventSubscription {
    cluster.scopes.open_scope(element_instance_key);
    CatchEventSubscription {
        workflow_instance_key,
        element_instance_key,
        bpmn_process_id: "order-process".to_string(),
        element_id: format!("catch-{message_name}"),
        message_name: message_name.to_string(),
        correlation_key: correlation_key.to_string(),
        close_on_correlate: true,
    }
}

pub fn message(name: &str, correlation_key: &str, ttl: i64, variables: Value) -> MessageRecord {
    MessageRecord::new(name, correlation_key)
        .with_time_to_live(ttl)
        .with_variables(variables)
}

pub fn start_event(
    workflow_key: Key,
    start_event_id: &str,
    message_name: &str,
) -> MessageStartEventSubscriptionRecord {
    MessageStartEventSubscriptionRecord {
        workflow_key,
        bpmn_process_id: "order-process".to_string(),
        start_event_id: start_event_id.to_string(),
        message_name: message_name.to_string(),
    }
}
