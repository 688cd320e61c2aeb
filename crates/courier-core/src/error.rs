// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for courier-core.
//!
//! Two families live here. [`Rejection`] is the log-level outcome of a command
//! that was well-formed but not applicable (stale, duplicated, out of phase); it
//! is written to the partition log and never stops processing. [`CoreError`]
//! covers conditions outside that taxonomy: invariant violations with no legal
//! recovery path and failures of the hosting runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;
use crate::key::{Key, PartitionId};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Why a command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    /// The targeted subscription or message does not exist (stale or already processed).
    NotFound,
    /// The target exists but is in the wrong phase (duplicate open, already closing).
    InvalidState,
    /// A message with the same id is still stored.
    AlreadyExists,
    /// Processing the command failed on an invariant violation.
    ProcessingError,
}

impl RejectionType {
    /// Stable code used on records and command responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command rejection as it appears on the log and in responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Rejection category.
    pub kind: RejectionType,
    /// Human-readable reason.
    pub reason: String,
}

impl Rejection {
    /// Create a rejection of the given kind.
    pub fn new(kind: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// `NOT_FOUND` rejection.
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::NotFound, reason)
    }

    /// `INVALID_STATE` rejection.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }

    /// `ALREADY_EXISTS` rejection.
    pub fn already_exists(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::AlreadyExists, reason)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Errors that are not log-level rejections.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The event scope of a freshly validated start event refused the trigger.
    #[error(
        "Expected to trigger start event '{element_id}' of workflow '{workflow_key}', but the event scope rejected it"
    )]
    StartEventNotTriggered {
        /// Workflow whose start event could not be triggered.
        workflow_key: Key,
        /// Start event element id.
        element_id: String,
    },

    /// No partition with this id is hosted.
    #[error("Partition {0} is not available")]
    PartitionUnavailable(PartitionId),

    /// The partition stopped before it answered a request.
    #[error("Partition {0} stopped before responding")]
    ResponseDropped(PartitionId),

    /// A request outside the command log was rejected.
    #[error("Request rejected: {0}")]
    Rejected(Rejection),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StartEventNotTriggered { .. } => "START_EVENT_NOT_TRIGGERED",
            Self::PartitionUnavailable(_) => "PARTITION_UNAVAILABLE",
            Self::ResponseDropped(_) => "RESPONSE_DROPPED",
            Self::Rejected(_) => "COMMAND_REJECTED",
            Self::Config(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Turn this error into the rejection recorded for the failed command.
    pub fn to_rejection(&self) -> Rejection {
        match self {
            Self::Rejected(rejection) => rejection.clone(),
            _ => Rejection::new(RejectionType::ProcessingError, self.to_string()),
        }
    }
}
