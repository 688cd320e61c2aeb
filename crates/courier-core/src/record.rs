// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands, events and rejections as they appear on a partition log.
//!
//! Intents are grouped per value type. Classification (which value type an
//! intent belongs to, whether it is a command or an event) is an exhaustive
//! match, so adding an intent without classifying it does not compile.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Rejection;
use crate::key::{Key, NO_KEY, PartitionId};

// ============================================================================
// Record values
// ============================================================================

/// A published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message name.
    pub name: String,
    /// Correlation key, may be empty.
    pub correlation_key: String,
    /// Time to live in milliseconds. Zero or less means "correlate now or never".
    pub time_to_live: i64,
    /// Optional deduplication token. Empty means no id.
    pub message_id: String,
    /// Message payload.
    pub variables: Value,
}

impl MessageRecord {
    /// Message with an empty payload, no id and no TTL.
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
            time_to_live: 0,
            message_id: String::new(),
            variables: Value::Object(Default::default()),
        }
    }

    /// Set the time to live in milliseconds.
    pub fn with_time_to_live(mut self, time_to_live: i64) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Set the deduplication id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the payload.
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Whether a deduplication id was supplied.
    pub fn has_message_id(&self) -> bool {
        !self.message_id.is_empty()
    }
}

/// Message-side subscription record, exchanged between partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSubscriptionRecord {
    /// Workflow instance holding the subscription.
    pub workflow_instance_key: Key,
    /// Element instance (catch event) holding the subscription.
    pub element_instance_key: Key,
    /// Process the workflow instance belongs to.
    pub bpmn_process_id: String,
    /// Correlated message, `NO_KEY` until correlating.
    pub message_key: Key,
    /// Message name.
    pub message_name: String,
    /// Correlation key.
    pub correlation_key: String,
    /// Remove the subscription once a message was correlated.
    pub close_on_correlate: bool,
    /// Payload of the correlated message.
    pub variables: Value,
}

impl MessageSubscriptionRecord {
    /// Catching-side view of this record.
    pub fn to_workflow_instance_subscription_record(
        &self,
        subscription_partition_id: PartitionId,
    ) -> WorkflowInstanceSubscriptionRecord {
        WorkflowInstanceSubscriptionRecord {
            subscription_partition_id,
            workflow_instance_key: self.workflow_instance_key,
            element_instance_key: self.element_instance_key,
            bpmn_process_id: self.bpmn_process_id.clone(),
            message_key: self.message_key,
            message_name: self.message_name.clone(),
            correlation_key: self.correlation_key.clone(),
            close_on_correlate: self.close_on_correlate,
            variables: self.variables.clone(),
        }
    }
}

/// Catching-side subscription record, exchanged between partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceSubscriptionRecord {
    /// Partition that owns messages for the correlation key.
    pub subscription_partition_id: PartitionId,
    /// Workflow instance holding the subscription.
    pub workflow_instance_key: Key,
    /// Element instance (catch event) holding the subscription.
    pub element_instance_key: Key,
    /// Process the workflow instance belongs to.
    pub bpmn_process_id: String,
    /// Correlated message, `NO_KEY` outside of correlation.
    pub message_key: Key,
    /// Message name.
    pub message_name: String,
    /// Correlation key.
    pub correlation_key: String,
    /// Remove the subscription once a message was correlated.
    pub close_on_correlate: bool,
    /// Payload of the correlated message.
    pub variables: Value,
}

impl WorkflowInstanceSubscriptionRecord {
    /// Message-side view of this record.
    pub fn to_message_subscription_record(&self) -> MessageSubscriptionRecord {
        MessageSubscriptionRecord {
            workflow_instance_key: self.workflow_instance_key,
            element_instance_key: self.element_instance_key,
            bpmn_process_id: self.bpmn_process_id.clone(),
            message_key: self.message_key,
            message_name: self.message_name.clone(),
            correlation_key: self.correlation_key.clone(),
            close_on_correlate: self.close_on_correlate,
            variables: self.variables.clone(),
        }
    }
}

/// Subscription of a deployed workflow's message start event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageStartEventSubscriptionRecord {
    /// Deployed workflow (one version of a process).
    pub workflow_key: Key,
    /// Process id shared by all versions.
    pub bpmn_process_id: String,
    /// Start event element id.
    pub start_event_id: String,
    /// Message name the start event listens to.
    pub message_name: String,
}

/// Workflow instance event written by the correlation core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceRecord {
    /// Process id.
    pub bpmn_process_id: String,
    /// Deployed workflow, `NO_KEY` when unknown.
    pub workflow_key: Key,
    /// Workflow instance.
    pub workflow_instance_key: Key,
    /// Element the event is about.
    pub element_id: String,
    /// Message that caused the event, `NO_KEY` otherwise.
    pub message_key: Key,
    /// Payload handed to the event scope.
    pub variables: Value,
}

impl WorkflowInstanceRecord {
    /// Record describing a whole process instance.
    pub fn process_instance(
        bpmn_process_id: impl Into<String>,
        workflow_key: Key,
        workflow_instance_key: Key,
    ) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            workflow_key,
            workflow_instance_key,
            element_id: String::new(),
            message_key: NO_KEY,
            variables: Value::Null,
        }
    }
}

/// Any record value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    /// Message value.
    Message(MessageRecord),
    /// Message subscription value.
    MessageSubscription(MessageSubscriptionRecord),
    /// Workflow instance subscription value.
    WorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    /// Message start event subscription value.
    MessageStartEventSubscription(MessageStartEventSubscriptionRecord),
    /// Workflow instance value.
    WorkflowInstance(WorkflowInstanceRecord),
}

impl From<MessageRecord> for RecordValue {
    fn from(value: MessageRecord) -> Self {
        Self::Message(value)
    }
}

impl From<MessageSubscriptionRecord> for RecordValue {
    fn from(value: MessageSubscriptionRecord) -> Self {
        Self::MessageSubscription(value)
    }
}

impl From<WorkflowInstanceSubscriptionRecord> for RecordValue {
    fn from(value: WorkflowInstanceSubscriptionRecord) -> Self {
        Self::WorkflowInstanceSubscription(value)
    }
}

impl From<MessageStartEventSubscriptionRecord> for RecordValue {
    fn from(value: MessageStartEventSubscriptionRecord) -> Self {
        Self::MessageStartEventSubscription(value)
    }
}

impl From<WorkflowInstanceRecord> for RecordValue {
    fn from(value: WorkflowInstanceRecord) -> Self {
        Self::WorkflowInstance(value)
    }
}

// ============================================================================
// Intents
// ============================================================================

/// Kind of entry on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    /// A request to change state.
    Command,
    /// A state change that happened.
    Event,
    /// A command that was not applied.
    CommandRejection,
}

/// Value type of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// Messages.
    Message,
    /// Message-side subscriptions.
    MessageSubscription,
    /// Catching-side subscriptions.
    WorkflowInstanceSubscription,
    /// Message start event subscriptions.
    MessageStartEventSubscription,
    /// Workflow instances.
    WorkflowInstance,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageIntent {
    Publish,
    Published,
    Delete,
    Deleted,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSubscriptionIntent {
    Open,
    Opened,
    Correlate,
    Correlated,
    Close,
    Closed,
    Reject,
    Rejected,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceSubscriptionIntent {
    Open,
    Opened,
    Correlate,
    Correlated,
    Close,
    Closed,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStartEventSubscriptionIntent {
    Open,
    Opened,
    Close,
    Closed,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowInstanceIntent {
    EventOccurred,
    ElementCompleted,
    ElementTerminated,
}

/// Intent of a record, tagged by value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    /// Message intents.
    Message(MessageIntent),
    /// Message subscription intents.
    MessageSubscription(MessageSubscriptionIntent),
    /// Workflow instance subscription intents.
    WorkflowInstanceSubscription(WorkflowInstanceSubscriptionIntent),
    /// Message start event subscription intents.
    MessageStartEventSubscription(MessageStartEventSubscriptionIntent),
    /// Workflow instance intents.
    WorkflowInstance(WorkflowInstanceIntent),
}

impl Intent {
    /// Value type this intent applies to.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Message(_) => ValueType::Message,
            Self::MessageSubscription(_) => ValueType::MessageSubscription,
            Self::WorkflowInstanceSubscription(_) => ValueType::WorkflowInstanceSubscription,
            Self::MessageStartEventSubscription(_) => ValueType::MessageStartEventSubscription,
            Self::WorkflowInstance(_) => ValueType::WorkflowInstance,
        }
    }

    /// Whether the intent names something that happened rather than a request.
    pub fn is_event(&self) -> bool {
        use MessageIntent as M;
        use MessageStartEventSubscriptionIntent as S;
        use MessageSubscriptionIntent as MS;
        use WorkflowInstanceSubscriptionIntent as WS;

        match self {
            Self::Message(intent) => match intent {
                M::Publish | M::Delete => false,
                M::Published | M::Deleted => true,
            },
            Self::MessageSubscription(intent) => match intent {
                MS::Open | MS::Correlate | MS::Close | MS::Reject => false,
                MS::Opened | MS::Correlated | MS::Closed | MS::Rejected => true,
            },
            Self::WorkflowInstanceSubscription(intent) => match intent {
                WS::Open | WS::Correlate | WS::Close => false,
                WS::Opened | WS::Correlated | WS::Closed => true,
            },
            Self::MessageStartEventSubscription(intent) => match intent {
                S::Open | S::Close => false,
                S::Opened | S::Closed => true,
            },
            Self::WorkflowInstance(_) => true,
        }
    }
}

impl From<MessageIntent> for Intent {
    fn from(intent: MessageIntent) -> Self {
        Self::Message(intent)
    }
}

impl From<MessageSubscriptionIntent> for Intent {
    fn from(intent: MessageSubscriptionIntent) -> Self {
        Self::MessageSubscription(intent)
    }
}

impl From<WorkflowInstanceSubscriptionIntent> for Intent {
    fn from(intent: WorkflowInstanceSubscriptionIntent) -> Self {
        Self::WorkflowInstanceSubscription(intent)
    }
}

impl From<MessageStartEventSubscriptionIntent> for Intent {
    fn from(intent: MessageStartEventSubscriptionIntent) -> Self {
        Self::MessageStartEventSubscription(intent)
    }
}

impl From<WorkflowInstanceIntent> for Intent {
    fn from(intent: WorkflowInstanceIntent) -> Self {
        Self::WorkflowInstance(intent)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Payload of a command, one variant per command intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandBody {
    /// Publish a message.
    PublishMessage(MessageRecord),
    /// Delete a stored message (key = message key).
    DeleteMessage(MessageRecord),
    /// Open a message-side subscription.
    OpenMessageSubscription(MessageSubscriptionRecord),
    /// Catching side acknowledged a correlation.
    CorrelateMessageSubscription(MessageSubscriptionRecord),
    /// Close a message-side subscription.
    CloseMessageSubscription(MessageSubscriptionRecord),
    /// Catching side could not honour a correlation.
    RejectMessageSubscription(MessageSubscriptionRecord),
    /// Message side acknowledged an open.
    OpenWorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    /// Message side correlated a message.
    CorrelateWorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    /// Message side acknowledged a close.
    CloseWorkflowInstanceSubscription(WorkflowInstanceSubscriptionRecord),
    /// Open a message start event subscription.
    OpenMessageStartEventSubscription(MessageStartEventSubscriptionRecord),
    /// Close all start event subscriptions of a workflow.
    CloseMessageStartEventSubscription(MessageStartEventSubscriptionRecord),
}

impl CommandBody {
    /// Intent of this command.
    pub fn intent(&self) -> Intent {
        match self {
            Self::PublishMessage(_) => MessageIntent::Publish.into(),
            Self::DeleteMessage(_) => MessageIntent::Delete.into(),
            Self::OpenMessageSubscription(_) => MessageSubscriptionIntent::Open.into(),
            Self::CorrelateMessageSubscription(_) => MessageSubscriptionIntent::Correlate.into(),
            Self::CloseMessageSubscription(_) => MessageSubscriptionIntent::Close.into(),
            Self::RejectMessageSubscription(_) => MessageSubscriptionIntent::Reject.into(),
            Self::OpenWorkflowInstanceSubscription(_) => {
                WorkflowInstanceSubscriptionIntent::Open.into()
            }
            Self::CorrelateWorkflowInstanceSubscription(_) => {
                WorkflowInstanceSubscriptionIntent::Correlate.into()
            }
            Self::CloseWorkflowInstanceSubscription(_) => {
                WorkflowInstanceSubscriptionIntent::Close.into()
            }
            Self::OpenMessageStartEventSubscription(_) => {
                MessageStartEventSubscriptionIntent::Open.into()
            }
            Self::CloseMessageStartEventSubscription(_) => {
                MessageStartEventSubscriptionIntent::Close.into()
            }
        }
    }

    /// Record value carried by the command.
    pub fn value(&self) -> RecordValue {
        match self {
            Self::PublishMessage(v) | Self::DeleteMessage(v) => v.clone().into(),
            Self::OpenMessageSubscription(v)
            | Self::CorrelateMessageSubscription(v)
            | Self::CloseMessageSubscription(v)
            | Self::RejectMessageSubscription(v) => v.clone().into(),
            Self::OpenWorkflowInstanceSubscription(v)
            | Self::CorrelateWorkflowInstanceSubscription(v)
            | Self::CloseWorkflowInstanceSubscription(v) => v.clone().into(),
            Self::OpenMessageStartEventSubscription(v)
            | Self::CloseMessageStartEventSubscription(v) => v.clone().into(),
        }
    }
}

/// A command addressed to a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Key of the entity the command targets, `NO_KEY` for new entities.
    pub key: Key,
    /// Command payload.
    pub body: CommandBody,
}

impl Command {
    /// Command targeting an existing entity.
    pub fn new(key: Key, body: CommandBody) -> Self {
        Self { key, body }
    }

    /// Command without a target key.
    pub fn unkeyed(body: CommandBody) -> Self {
        Self { key: NO_KEY, body }
    }

    /// Intent of this command.
    pub fn intent(&self) -> Intent {
        self.body.intent()
    }
}

// ============================================================================
// Log entries and responses
// ============================================================================

/// One entry of a partition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position on the partition log, starting at 1.
    pub position: u64,
    /// Record key.
    pub key: Key,
    /// Command, event or rejection.
    pub record_type: RecordType,
    /// Record intent.
    pub intent: Intent,
    /// Record value.
    pub value: RecordValue,
    /// Rejection details for `CommandRejection` records.
    pub rejection: Option<Rejection>,
    /// Append time in epoch milliseconds.
    pub timestamp: i64,
}

impl Record {
    /// Whether this is an event with the given intent.
    pub fn is_event(&self, intent: impl Into<Intent>) -> bool {
        self.record_type == RecordType::Event && self.intent == intent.into()
    }

    /// Whether this is a rejection of a command with the given intent.
    pub fn is_rejection(&self, intent: impl Into<Intent>) -> bool {
        self.record_type == RecordType::CommandRejection && self.intent == intent.into()
    }
}

/// Response to the client that issued a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Key of the affected entity.
    pub key: Key,
    /// Resulting event intent, or the command intent for rejections.
    pub intent: Intent,
    /// Resulting value.
    pub value: RecordValue,
    /// Set when the command was rejected.
    pub rejection: Option<Rejection>,
}

impl CommandResponse {
    /// Whether the command was rejected.
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription_record() -> MessageSubscriptionRecord {
        MessageSubscriptionRecord {
            workflow_instance_key: 1,
            element_instance_key: 2,
            bpmn_process_id: "order-process".to_string(),
            message_key: NO_KEY,
            message_name: "payment".to_string(),
            correlation_key: "order-1".to_string(),
            close_on_correlate: true,
            variables: Value::Null,
        }
    }

    #[test]
    fn test_command_intents_are_commands() {
        let bodies = vec![
            CommandBody::PublishMessage(MessageRecord::new("a", "b")),
            CommandBody::DeleteMessage(MessageRecord::new("a", "b")),
            CommandBody::OpenMessageSubscription(subscription_record()),
            CommandBody::CorrelateMessageSubscription(subscription_record()),
            CommandBody::CloseMessageSubscription(subscription_record()),
            CommandBody::RejectMessageSubscription(subscription_record()),
            CommandBody::OpenMessageStartEventSubscription(MessageStartEventSubscriptionRecord {
                workflow_key: 1,
                bpmn_process_id: "p".to_string(),
                start_event_id: "start".to_string(),
                message_name: "m".to_string(),
            }),
        ];

        for body in bodies {
            let intent = body.intent();
            assert!(!intent.is_event(), "{intent:?} should be a command");
            assert_eq!(intent.value_type(), value_type_of(&body.value()));
        }
    }

    fn value_type_of(value: &RecordValue) -> ValueType {
        match value {
            RecordValue::Message(_) => ValueType::Message,
            RecordValue::MessageSubscription(_) => ValueType::MessageSubscription,
            RecordValue::WorkflowInstanceSubscription(_) => ValueType::WorkflowInstanceSubscription,
            RecordValue::MessageStartEventSubscription(_) => {
                ValueType::MessageStartEventSubscription
            }
            RecordValue::WorkflowInstance(_) => ValueType::WorkflowInstance,
        }
    }

    #[test]
    fn test_event_intents() {
        let test_cases: Vec<(Intent, bool)> = vec![
            (MessageIntent::Published.into(), true),
            (MessageIntent::Deleted.into(), true),
            (MessageSubscriptionIntent::Rejected.into(), true),
            (MessageSubscriptionIntent::Reject.into(), false),
            (WorkflowInstanceSubscriptionIntent::Closed.into(), true),
            (WorkflowInstanceSubscriptionIntent::Open.into(), false),
            (MessageStartEventSubscriptionIntent::Opened.into(), true),
            (WorkflowInstanceIntent::EventOccurred.into(), true),
            (WorkflowInstanceIntent::ElementCompleted.into(), true),
        ];

        for (intent, expected) in test_cases {
            assert_eq!(intent.is_event(), expected, "{intent:?}");
        }
    }

    #[test]
    fn test_message_record_builder() {
        let message = MessageRecord::new("payment", "order-1")
            .with_time_to_live(1_000)
            .with_message_id("msg-1")
            .with_variables(json!({"amount": 10}));

        assert_eq!(message.time_to_live, 1_000);
        assert!(message.has_message_id());
        assert_eq!(message.variables["amount"], 10);
        assert!(!MessageRecord::new("payment", "order-1").has_message_id());
    }

    #[test]
    fn test_record_value_serializes_with_value_type_tag() {
        let value: RecordValue = MessageRecord::new("payment", "order-1").into();
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["valueType"], "MESSAGE");
        assert_eq!(json["value"]["name"], "payment");
    }

    #[test]
    fn test_record_predicates() {
        let record = Record {
            position: 1,
            key: 5,
            record_type: RecordType::CommandRejection,
            intent: MessageIntent::Publish.into(),
            value: MessageRecord::new("a", "b").into(),
            rejection: Some(Rejection::already_exists("duplicate")),
            timestamp: 0,
        };

        assert!(record.is_rejection(MessageIntent::Publish));
        assert!(!record.is_event(MessageIntent::Publish));
    }
}
