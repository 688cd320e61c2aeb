// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Courier Core - Message Correlation Engine
//!
//! This crate correlates published messages with workflow instances that wait
//! for them. State is split into partitions; each partition owns its messages
//! and subscriptions and is mutated by a single processing loop only.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐                 ┌──────────────────────────────┐
//! │     catching partition       │                 │      message partition       │
//! │ (decode_partition_id(wik))   │                 │ (subscription_partition_id)  │
//! │                              │   open/close    │                              │
//! │  WorkflowInstanceSubscription│────────────────►│  MessageSubscription         │
//! │   OPENING → OPENED → CLOSING │                 │   OPENED ⇄ CORRELATING       │
//! │                              │◄────────────────│                              │
//! │                              │ ack / correlate │  MessageState                │
//! │          EventScope ◄────────│                 │   messages, markers, locks   │
//! │   (execution engine hook)    │ correlate/reject│                              │
//! │                              │────────────────►│  MessageStartEventSubscription│
//! └──────────────────────────────┘                 └──────────────────────────────┘
//! ```
//!
//! Every arrow is a [`record::Command`] handed to a
//! [`command_sender::SubscriptionCommandSender`]. Sends are fire-and-forget;
//! the pending checkers resend whatever was not acknowledged in time, and
//! every processor absorbs duplicates.
//!
//! # Commands
//!
//! | Command | Partition | Outcome |
//! |---------|-----------|---------|
//! | `PublishMessage` | message | `PUBLISHED`, correlations, start events, `DELETED` when TTL is 0 |
//! | `DeleteMessage` | message | `DELETED` or `NOT_FOUND` |
//! | `OpenMessageSubscription` | message | `OPENED` or `INVALID_STATE`, ack always sent |
//! | `CorrelateMessageSubscription` | message | `CORRELATED`, then close or look for the next message |
//! | `CloseMessageSubscription` | message | `CLOSED` or `NOT_FOUND`, ack always sent |
//! | `RejectMessageSubscription` | message | `REJECTED`, message offered to another subscription of the instance |
//! | `OpenWorkflowInstanceSubscription` | catching | `OPENED` |
//! | `CorrelateWorkflowInstanceSubscription` | catching | `CORRELATED` + `EVENT_OCCURRED`, or a rejection and a reject command |
//! | `CloseWorkflowInstanceSubscription` | catching | `CLOSED` |
//! | `OpenMessageStartEventSubscription` | every | `OPENED`, previous versions `CLOSED` |
//! | `CloseMessageStartEventSubscription` | every | one `CLOSED` per start event |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `COURIER_PARTITION_COUNT` | No | `3` | Number of partitions |
//! | `COURIER_SUBSCRIPTION_TIMEOUT_MS` | No | `10000` | Age after which a pending command is resent |
//! | `COURIER_SUBSCRIPTION_CHECK_INTERVAL_MS` | No | `30000` | Period of the pending checkers |
//! | `COURIER_MESSAGE_TTL_CHECK_INTERVAL_MS` | No | `60000` | Period of the TTL sweep |
//! | `COURIER_MESSAGE_TTL_BATCH_SIZE` | No | `100` | Expired messages deleted per sweep |
//! | `COURIER_COMMAND_QUEUE_CAPACITY` | No | `1024` | Bound of each partition inbox |
//!
//! # Modules
//!
//! - [`key`]: Keys, partition ids and correlation-key routing
//! - [`record`]: Commands, log records and their values
//! - [`state`]: Per-partition stores
//! - [`processor`]: Command processors and the processing context
//! - [`partition`]: Partition state machine and its log
//! - [`runtime`]: Tokio runtime hosting all partitions

#![deny(missing_docs)]

/// Time sources.
pub mod clock;

/// Cross-partition command transport.
pub mod command_sender;

/// Configuration loaded from environment variables.
pub mod config;

/// Matching of message-side subscriptions with stored messages.
pub mod correlator;

/// Error types with stable error codes.
pub mod error;

/// The execution-engine hook for triggering events.
pub mod event_scope;

/// Keys, partition ids and correlation-key routing.
pub mod key;

/// Periodic deletion of expired messages.
pub mod message_ttl_checker;

/// Partition state machine and its log.
pub mod partition;

/// Command processors.
pub mod processor;

/// Commands, records and record values.
pub mod record;

/// Tokio runtime hosting all partitions.
pub mod runtime;

/// Start of the next instance from a buffered message.
pub mod start_event_correlator;

/// Per-partition state.
pub mod state;

/// Resending of unacknowledged cross-partition commands.
pub mod subscription_checker;

pub use clock::{Clock, ControlledClock, SystemClock};
pub use command_sender::{QueuedCommandSender, SubscriptionCommandSender};
pub use config::Config;
pub use error::{CoreError, Rejection, RejectionType, Result};
pub use event_scope::{EventScope, EventScopeRegistry};
pub use partition::{Partition, ProcessingOutcome};
pub use processor::catch_event::CatchEventSubscription;
pub use runtime::{Broker, BrokerBuilder};
