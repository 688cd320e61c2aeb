// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One partition: state, log and the entry points that mutate them.
//!
//! A [`Partition`] is driven by exactly one caller at a time (the runtime's
//! partition task, or a test). Every entry point appends to the log before
//! returning; side effects of commands are handed back to the caller so the
//! client reply can go out first.

use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::clock::Clock;
use crate::command_sender::SubscriptionCommandSender;
use crate::config::Config;
use crate::error::{Rejection, Result};
use crate::event_scope::EventScope;
use crate::key::{Key, PartitionId};
use crate::message_ttl_checker::MessageTimeToLiveChecker;
use crate::processor::catch_event::{self, CatchEventSubscription};
use crate::processor::{
    PendingRecord, ProcessingContext, RecordWriter, ResponseWriter, SideEffects, process_command,
};
use crate::record::{
    Command, CommandResponse, Record, RecordType, WorkflowInstanceIntent, WorkflowInstanceRecord,
};
use crate::start_event_correlator::correlate_buffered_message;
use crate::state::PartitionState;
use crate::subscription_checker::{
    PendingMessageSubscriptionChecker, PendingWorkflowInstanceSubscriptionChecker,
};

/// Result of processing one command.
#[derive(Debug)]
pub struct ProcessingOutcome {
    /// Records appended for the command, starting with the command itself.
    pub records: Vec<Record>,
    /// Reply for the client that issued the command.
    pub response: Option<CommandResponse>,
    /// Sends to run once the reply is delivered.
    pub side_effects: SideEffects,
}

struct Step<T> {
    result: Result<T>,
    writer: RecordWriter,
    response: ResponseWriter,
    side_effects: SideEffects,
}

/// State machine of one partition.
pub struct Partition {
    state: PartitionState,
    log: Vec<Record>,
    sender: Arc<dyn SubscriptionCommandSender>,
    event_scope: Arc<dyn EventScope>,
    clock: Arc<dyn Clock>,
    partition_count: u32,
    message_checker: PendingMessageSubscriptionChecker,
    instance_checker: PendingWorkflowInstanceSubscriptionChecker,
    ttl_checker: MessageTimeToLiveChecker,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("partition_id", &self.partition_id())
            .field("partition_count", &self.partition_count)
            .field("log_len", &self.log.len())
            .finish()
    }
}

impl Partition {
    /// Create an empty partition.
    pub fn new(
        partition_id: PartitionId,
        config: &Config,
        sender: Arc<dyn SubscriptionCommandSender>,
        event_scope: Arc<dyn EventScope>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: PartitionState::new(partition_id),
            log: Vec::new(),
            sender,
            event_scope,
            clock,
            partition_count: config.partition_count,
            message_checker: PendingMessageSubscriptionChecker::new(config.subscription_timeout),
            instance_checker: PendingWorkflowInstanceSubscriptionChecker::new(
                config.subscription_timeout,
            ),
            ttl_checker: MessageTimeToLiveChecker::new(config.message_ttl_batch_size),
        }
    }

    /// Partition id.
    pub fn partition_id(&self) -> PartitionId {
        self.state.partition_id()
    }

    /// Current state.
    pub fn state(&self) -> &PartitionState {
        &self.state
    }

    /// The whole log.
    pub fn records(&self) -> &[Record] {
        &self.log
    }

    /// Append `command` and process it.
    ///
    /// A processor error discards everything the command buffered and records
    /// a `PROCESSING_ERROR` rejection instead.
    #[instrument(skip(self, command), fields(partition_id = self.state.partition_id(), intent = ?command.intent()))]
    pub fn process(&mut self, command: Command) -> ProcessingOutcome {
        let now = self.clock.now_millis();
        let first = self.log.len();
        self.append(
            now,
            PendingRecord {
                key: command.key,
                record_type: RecordType::Command,
                intent: command.intent(),
                value: command.body.value(),
                rejection: None,
            },
        );

        let Step {
            result,
            mut writer,
            mut response,
            mut side_effects,
        } = self.run(now, |ctx| process_command(ctx, &command));

        let response = match result {
            Ok(()) => {
                for pending in writer.take() {
                    self.append(now, pending);
                }
                response.take()
            }
            Err(err) => {
                error!(error = %err, error_code = err.error_code(), "Failed to process command");
                writer.reset();
                side_effects.clear();
                let rejection = err.to_rejection();
                self.append(
                    now,
                    PendingRecord {
                        key: command.key,
                        record_type: RecordType::CommandRejection,
                        intent: command.intent(),
                        value: command.body.value(),
                        rejection: Some(rejection.clone()),
                    },
                );
                Some(CommandResponse {
                    key: command.key,
                    intent: command.intent(),
                    value: command.body.value(),
                    rejection: Some(rejection),
                })
            }
        };

        ProcessingOutcome {
            records: self.log[first..].to_vec(),
            response,
            side_effects,
        }
    }

    /// A catch event was entered. Sends the open command right away.
    #[instrument(skip(self, subscription), fields(partition_id = self.state.partition_id(), element_instance_key = subscription.element_instance_key))]
    pub fn subscribe(
        &mut self,
        subscription: &CatchEventSubscription,
    ) -> std::result::Result<(), Rejection> {
        let now = self.clock.now_millis();
        let Step {
            result,
            side_effects,
            ..
        } = self.run(now, |ctx| Ok(catch_event::subscribe(ctx, subscription)));

        match result {
            Ok(Ok(())) => {
                side_effects.execute();
                Ok(())
            }
            Ok(Err(rejection)) => {
                debug!(reason = %rejection.reason, "Catch event subscription rejected");
                Err(rejection)
            }
            Err(err) => Err(err.to_rejection()),
        }
    }

    /// A catch event was left. Returns how many subscriptions started closing.
    #[instrument(skip(self), fields(partition_id = self.state.partition_id()))]
    pub fn unsubscribe(&mut self, element_instance_key: Key) -> usize {
        let now = self.clock.now_millis();
        let Step {
            result,
            side_effects,
            ..
        } = self.run(now, |ctx| Ok(catch_event::unsubscribe(ctx, element_instance_key)));

        side_effects.execute();
        result.unwrap_or_default()
    }

    /// A workflow instance completed or was terminated.
    ///
    /// Appends the lifecycle event, then lets a buffered message start the next
    /// instance for the correlation key the finished instance held. Returns
    /// the key of that instance.
    #[instrument(skip(self, instance), fields(partition_id = self.state.partition_id(), workflow_instance_key = instance.workflow_instance_key))]
    pub fn workflow_instance_finished(
        &mut self,
        instance: WorkflowInstanceRecord,
        terminated: bool,
    ) -> Result<Option<Key>> {
        let now = self.clock.now_millis();
        let intent = if terminated {
            WorkflowInstanceIntent::ElementTerminated
        } else {
            WorkflowInstanceIntent::ElementCompleted
        };
        self.append(
            now,
            PendingRecord {
                key: instance.workflow_instance_key,
                record_type: RecordType::Event,
                intent: intent.into(),
                value: instance.clone().into(),
                rejection: None,
            },
        );

        let Step {
            result,
            mut writer,
            side_effects,
            ..
        } = self.run(now, |ctx| correlate_buffered_message(ctx, &instance));

        match result {
            Ok(started) => {
                for pending in writer.take() {
                    self.append(now, pending);
                }
                side_effects.execute();
                Ok(started)
            }
            Err(err) => {
                error!(error = %err, "Failed to correlate buffered message");
                Err(err)
            }
        }
    }

    /// Resend overdue cross-partition commands on both sides.
    pub fn check_pending_subscriptions(&mut self) -> usize {
        let now = self.clock.now_millis();
        let resent = self
            .message_checker
            .check(&mut self.state, self.sender.as_ref(), now);
        resent
            + self
                .instance_checker
                .check(&mut self.state, self.sender.as_ref(), now)
    }

    /// Delete expired messages through the command path. Returns how many
    /// were deleted.
    pub fn check_message_ttl(&mut self) -> usize {
        let now = self.clock.now_millis();
        let commands = self
            .ttl_checker
            .expired_message_commands(&self.state.messages, now);

        let mut deleted = 0;
        for command in commands {
            let outcome = self.process(command);
            if outcome.response.is_some_and(|r| !r.is_rejected()) {
                deleted += 1;
            }
            outcome.side_effects.execute();
        }
        deleted
    }

    fn run<T, F>(&mut self, now: i64, f: F) -> Step<T>
    where
        F: FnOnce(&mut ProcessingContext<'_>) -> Result<T>,
    {
        let mut writer = RecordWriter::default();
        let mut response = ResponseWriter::default();
        let mut side_effects = SideEffects::default();
        let result = {
            let mut ctx = ProcessingContext {
                state: &mut self.state,
                writer: &mut writer,
                response: &mut response,
                side_effects: &mut side_effects,
                sender: &self.sender,
                event_scope: &self.event_scope,
                now,
                partition_count: self.partition_count,
            };
            f(&mut ctx)
        };
        Step {
            result,
            writer,
            response,
            side_effects,
        }
    }

    fn append(&mut self, timestamp: i64, pending: PendingRecord) {
        self.log.push(Record {
            position: self.log.len() as u64 + 1,
            key: pending.key,
            record_type: pending.record_type,
            intent: pending.intent,
            value: pending.value,
            rejection: pending.rejection,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ControlledClock;
    use crate::command_sender::QueuedCommandSender;
    use crate::error::RejectionType;
    use crate::event_scope::EventScopeRegistry;
    use crate::record::{
        CommandBody, MessageIntent, MessageRecord, MessageStartEventSubscriptionRecord,
    };
    use std::time::Duration;

    struct Fixture {
        partition: Partition,
        queue: QueuedCommandSender,
        scopes: EventScopeRegistry,
        clock: ControlledClock,
    }

    fn fixture() -> Fixture {
        let queue = QueuedCommandSender::new();
        let scopes = EventScopeRegistry::new();
        let clock = ControlledClock::new(1_000);
        let config = Config {
            partition_count: 1,
            subscription_timeout: Duration::from_secs(10),
            message_ttl_batch_size: 10,
            ..Config::default()
        };
        let partition = Partition::new(
            1,
            &config,
            Arc::new(queue.clone()),
            Arc::new(scopes.clone()),
            Arc::new(clock.clone()),
        );
        Fixture {
            partition,
            queue,
            scopes,
            clock,
        }
    }

    fn publish(ttl: i64) -> Command {
        Command::unkeyed(CommandBody::PublishMessage(
            MessageRecord::new("placed", "order-1").with_time_to_live(ttl),
        ))
    }

    fn deploy(workflow_key: Key) -> Command {
        Command::unkeyed(CommandBody::OpenMessageStartEventSubscription(
            MessageStartEventSubscriptionRecord {
                workflow_key,
                bpmn_process_id: "order".to_string(),
                start_event_id: "start".to_string(),
                message_name: "placed".to_string(),
            },
        ))
    }

    #[test]
    fn test_command_is_logged_before_follow_ups() {
        let mut f = fixture();
        let outcome = f.partition.process(publish(5_000));

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].record_type, RecordType::Command);
        assert_eq!(outcome.records[0].position, 1);
        assert!(outcome.records[1].is_event(MessageIntent::Published));
        assert_eq!(outcome.records[1].position, 2);
        assert_eq!(outcome.records[1].timestamp, 1_000);

        let response = outcome.response.unwrap();
        assert_eq!(response.key, outcome.records[1].key);
        assert_eq!(f.partition.records().len(), 2);
    }

    #[test]
    fn test_refused_start_event_becomes_processing_error() {
        let mut f = fixture();
        f.partition.process(deploy(3));

        let outcome = f.partition.process(publish(5_000));

        let rejection = outcome.response.unwrap().rejection.unwrap();
        assert_eq!(rejection.kind, RejectionType::ProcessingError);
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records[1].is_rejection(MessageIntent::Publish));
        assert!(outcome.side_effects.is_empty());
        assert!(f.partition.state().messages.is_empty());

        // the partition keeps working once the scope accepts triggers
        f.scopes.open_scope(3);
        let outcome = f.partition.process(publish(5_000));
        assert!(!outcome.response.unwrap().is_rejected());
    }

    #[test]
    fn test_ttl_sweep_deletes_through_the_log() {
        let mut f = fixture();
        f.partition.process(publish(5_000));
        f.partition.process(publish(60_000));

        assert_eq!(f.partition.check_message_ttl(), 0);
        f.clock.advance_millis(5_000);
        assert_eq!(f.partition.check_message_ttl(), 1);
        assert_eq!(f.partition.state().messages.len(), 1);

        let last = f.partition.records().last().unwrap();
        assert!(last.is_event(MessageIntent::Deleted));
    }

    #[test]
    fn test_subscribe_sends_open_immediately() {
        let mut f = fixture();
        let catch_event = CatchEventSubscription {
            workflow_instance_key: crate::key::encode_partition_id(1, 100),
            element_instance_key: crate::key::encode_partition_id(1, 101),
            bpmn_process_id: "order".to_string(),
            element_id: "wait".to_string(),
            message_name: "paid".to_string(),
            correlation_key: "order-1".to_string(),
            close_on_correlate: true,
        };

        f.partition.subscribe(&catch_event).unwrap();
        assert_eq!(f.queue.len(), 1);

        let rejection = f.partition.subscribe(&catch_event).unwrap_err();
        assert_eq!(rejection.kind, RejectionType::InvalidState);

        assert_eq!(f.partition.unsubscribe(catch_event.element_instance_key), 1);
        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn test_pending_checker_resends_after_timeout() {
        let mut f = fixture();
        let catch_event = CatchEventSubscription {
            workflow_instance_key: crate::key::encode_partition_id(1, 100),
            element_instance_key: crate::key::encode_partition_id(1, 101),
            bpmn_process_id: "order".to_string(),
            element_id: "wait".to_string(),
            message_name: "paid".to_string(),
            correlation_key: "order-1".to_string(),
            close_on_correlate: true,
        };
        f.partition.subscribe(&catch_event).unwrap();
        f.queue.drain();

        assert_eq!(f.partition.check_pending_subscriptions(), 0);
        f.clock.advance_millis(10_001);
        assert_eq!(f.partition.check_pending_subscriptions(), 1);
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn test_finished_instance_is_logged() {
        let mut f = fixture();
        let instance = WorkflowInstanceRecord::process_instance("order", 3, 42);

        let started = f.partition.workflow_instance_finished(instance, true).unwrap();
        assert_eq!(started, None);
        assert!(
            f.partition
                .records()
                .last()
                .unwrap()
                .is_event(WorkflowInstanceIntent::ElementTerminated)
        );
    }
}
