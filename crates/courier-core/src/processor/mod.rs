// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command processing.
//!
//! A processor applies one command to the partition state and reports the
//! outcome through three channels:
//!
//! | Channel | Written by | Becomes |
//! |---------|------------|---------|
//! | [`RecordWriter`] | `append_follow_up_event`, `append_new_event`, `append_rejection` | log records, appended after the command |
//! | [`ResponseWriter`] | `write_event`, `write_rejection` | reply to the client that issued the command |
//! | [`SideEffects`] | `push` | cross-partition sends, run after the records and the reply |
//!
//! Rejections are regular outcomes. A processor only returns `Err` when an
//! invariant is violated; the partition then discards everything the
//! processor buffered.

/// Catch event subscribe/unsubscribe (catching side).
pub mod catch_event;
/// Message publish and delete.
pub mod message;
/// Message start event subscription open/close.
pub mod message_start_event_subscription;
/// Message-side subscription open/correlate/close/reject.
pub mod message_subscription;
/// Catching-side subscription open/correlate/close.
pub mod workflow_instance_subscription;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::command_sender::SubscriptionCommandSender;
use crate::error::{Rejection, RejectionType, Result};
use crate::event_scope::EventScope;
use crate::key::{Key, PartitionId};
use crate::record::{Command, CommandBody, CommandResponse, Intent, RecordType, RecordValue};
use crate::state::PartitionState;

// ============================================================================
// Writers
// ============================================================================

/// A record written by a processor, before it gets a log position.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    /// Record key.
    pub key: Key,
    /// Event or rejection.
    pub record_type: RecordType,
    /// Record intent.
    pub intent: Intent,
    /// Record value.
    pub value: RecordValue,
    /// Rejection details.
    pub rejection: Option<Rejection>,
}

/// Buffers the follow-up records of one command.
#[derive(Debug, Default)]
pub struct RecordWriter {
    records: Vec<PendingRecord>,
}

impl RecordWriter {
    /// Event produced by the command, keyed by the affected entity.
    pub fn append_follow_up_event(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) {
        self.push_event(key, intent.into(), value.into());
    }

    /// Event about another entity than the command targets.
    pub fn append_new_event(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) {
        self.push_event(key, intent.into(), value.into());
    }

    /// Reject the command.
    pub fn append_rejection(
        &mut self,
        command: &Command,
        kind: RejectionType,
        reason: impl Into<String>,
    ) {
        let rejection = Rejection::new(kind, reason);
        debug!(
            intent = ?command.intent(),
            key = command.key,
            rejection_type = %rejection.kind,
            reason = %rejection.reason,
            "Command rejected"
        );
        self.records.push(PendingRecord {
            key: command.key,
            record_type: RecordType::CommandRejection,
            intent: command.intent(),
            value: command.body.value(),
            rejection: Some(rejection),
        });
    }

    /// Buffered records.
    pub fn records(&self) -> &[PendingRecord] {
        &self.records
    }

    /// Drop everything buffered so far.
    pub fn reset(&mut self) {
        self.records.clear();
    }

    /// Take the buffered records.
    pub fn take(&mut self) -> Vec<PendingRecord> {
        std::mem::take(&mut self.records)
    }

    fn push_event(&mut self, key: Key, intent: Intent, value: RecordValue) {
        self.records.push(PendingRecord {
            key,
            record_type: RecordType::Event,
            intent,
            value,
            rejection: None,
        });
    }
}

/// Holds the reply for the client that issued the command.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    response: Option<CommandResponse>,
}

impl ResponseWriter {
    /// Reply with the event the command produced.
    pub fn write_event(&mut self, key: Key, intent: impl Into<Intent>, value: impl Into<RecordValue>) {
        self.response = Some(CommandResponse {
            key,
            intent: intent.into(),
            value: value.into(),
            rejection: None,
        });
    }

    /// Reply with a rejection of the command.
    pub fn write_rejection(&mut self, command: &Command, rejection: Rejection) {
        self.response = Some(CommandResponse {
            key: command.key,
            intent: command.intent(),
            value: command.body.value(),
            rejection: Some(rejection),
        });
    }

    /// Take the reply.
    pub fn take(&mut self) -> Option<CommandResponse> {
        self.response.take()
    }
}

// ============================================================================
// Side effects
// ============================================================================

/// A deferred send. Returns whether the transport accepted it.
pub type SideEffect = Box<dyn FnOnce() -> bool + Send>;

/// Sends registered while processing, run after the records are appended.
#[derive(Default)]
pub struct SideEffects {
    effects: Vec<(&'static str, SideEffect)>,
}

impl SideEffects {
    /// Register a deferred send.
    pub fn push<F>(&mut self, name: &'static str, effect: F)
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        self.effects.push((name, Box::new(effect)));
    }

    /// Number of registered side effects.
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Whether none are registered.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Drop every registered side effect.
    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Run every side effect in registration order, returning how many were
    /// not accepted.
    pub fn execute(self) -> usize {
        let mut failed = 0;
        for (name, effect) in self.effects {
            if !effect() {
                failed += 1;
                warn!(side_effect = name, "Side effect was not accepted, pending checker will retry");
            }
        }
        failed
    }
}

impl fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.effects.iter().map(|(name, _)| *name).collect();
        f.debug_struct("SideEffects").field("effects", &names).finish()
    }
}

// ============================================================================
// Context and dispatch
// ============================================================================

/// Everything a processor may touch.
pub struct ProcessingContext<'a> {
    /// Partition state.
    pub state: &'a mut PartitionState,
    /// Follow-up records.
    pub writer: &'a mut RecordWriter,
    /// Client reply.
    pub response: &'a mut ResponseWriter,
    /// Deferred sends.
    pub side_effects: &'a mut SideEffects,
    /// Cross-partition transport.
    pub sender: &'a Arc<dyn SubscriptionCommandSender>,
    /// Execution-engine hook.
    pub event_scope: &'a Arc<dyn EventScope>,
    /// Processing time, epoch milliseconds.
    pub now: i64,
    /// Number of partitions in the cluster.
    pub partition_count: u32,
}

impl ProcessingContext<'_> {
    /// Partition being processed.
    pub fn partition_id(&self) -> PartitionId {
        self.state.partition_id()
    }

    /// Reject the command on the log and in the reply.
    pub fn reject(&mut self, command: &Command, kind: RejectionType, reason: impl Into<String>) {
        let reason = reason.into();
        self.writer.append_rejection(command, kind, reason.clone());
        self.response
            .write_rejection(command, Rejection::new(kind, reason));
    }
}

/// Apply one command.
pub fn process_command(ctx: &mut ProcessingContext<'_>, command: &Command) -> Result<()> {
    match &command.body {
        CommandBody::PublishMessage(record) => message::publish(ctx, command, record),
        CommandBody::DeleteMessage(_) => {
            message::delete(ctx, command);
            Ok(())
        }
        CommandBody::OpenMessageSubscription(record) => {
            message_subscription::open(ctx, command, record);
            Ok(())
        }
        CommandBody::CorrelateMessageSubscription(record) => {
            message_subscription::correlate(ctx, command, record);
            Ok(())
        }
        CommandBody::CloseMessageSubscription(record) => {
            message_subscription::close(ctx, command, record);
            Ok(())
        }
        CommandBody::RejectMessageSubscription(record) => {
            message_subscription::reject(ctx, command, record);
            Ok(())
        }
        CommandBody::OpenWorkflowInstanceSubscription(record) => {
            workflow_instance_subscription::open(ctx, command, record);
            Ok(())
        }
        CommandBody::CorrelateWorkflowInstanceSubscription(record) => {
            workflow_instance_subscription::correlate(ctx, command, record);
            Ok(())
        }
        CommandBody::CloseWorkflowInstanceSubscription(record) => {
            workflow_instance_subscription::close(ctx, command, record);
            Ok(())
        }
        CommandBody::OpenMessageStartEventSubscription(record) => {
            message_start_event_subscription::open(ctx, command, record);
            Ok(())
        }
        CommandBody::CloseMessageStartEventSubscription(record) => {
            message_start_event_subscription::close(ctx, command, record);
            Ok(())
        }
    }
}

/// Shared fixture for processor tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::command_sender::QueuedCommandSender;
    use crate::event_scope::EventScopeRegistry;

    pub(crate) struct Harness {
        pub state: PartitionState,
        pub writer: RecordWriter,
        pub response: ResponseWriter,
        pub side_effects: SideEffects,
        pub queue: QueuedCommandSender,
        pub scopes: EventScopeRegistry,
        pub sender: Arc<dyn SubscriptionCommandSender>,
        pub event_scope: Arc<dyn EventScope>,
        pub now: i64,
        pub partition_count: u32,
    }

    impl Harness {
        pub fn new(partition_id: PartitionId) -> Self {
            let queue = QueuedCommandSender::new();
            let scopes = EventScopeRegistry::new();
            Self {
                state: PartitionState::new(partition_id),
                writer: RecordWriter::default(),
                response: ResponseWriter::default(),
                side_effects: SideEffects::default(),
                sender: Arc::new(queue.clone()),
                event_scope: Arc::new(scopes.clone()),
                queue,
                scopes,
                now: 1_000,
                partition_count: 1,
            }
        }

        pub fn context(&mut self) -> ProcessingContext<'_> {
            ProcessingContext {
                state: &mut self.state,
                writer: &mut self.writer,
                response: &mut self.response,
                side_effects: &mut self.side_effects,
                sender: &self.sender,
                event_scope: &self.event_scope,
                now: self.now,
                partition_count: self.partition_count,
            }
        }

        pub fn run_side_effects(&mut self) -> usize {
            std::mem::take(&mut self.side_effects).execute()
        }

        /// Process a command with fresh writers and run its side effects.
        pub fn process(&mut self, command: Command) -> Result<Vec<PendingRecord>> {
            self.writer.reset();
            self.response = ResponseWriter::default();
            process_command(&mut self.context(), &command)?;
            self.run_side_effects();
            Ok(self.writer.take())
        }

        pub fn sent(&self) -> Vec<Command> {
            self.queue.drain().into_iter().map(|(_, c)| c).collect()
        }
    }

    pub(crate) fn only_rejection(records: &[PendingRecord]) -> &Rejection {
        assert_eq!(records.len(), 1, "expected a single record, got {records:?}");
        records[0]
            .rejection
            .as_ref()
            .unwrap_or_else(|| panic!("expected a rejection, got {:?}", records[0]))
    }
}
