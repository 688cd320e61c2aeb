// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic sweep of expired messages.
//!
//! The sweep never removes messages itself. It issues one delete command per
//! expired message, which the partition processes like any other command so
//! the removal lands on the log.

use tracing::debug;

use crate::record::{Command, CommandBody};
use crate::state::MessageState;

/// Collects delete commands for messages whose TTL ran out.
#[derive(Debug, Clone)]
pub struct MessageTimeToLiveChecker {
    batch_size: usize,
}

impl MessageTimeToLiveChecker {
    /// Checker deleting at most `batch_size` messages per run.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Delete commands for messages with a deadline at or before `now`,
    /// earliest deadline first.
    pub fn expired_message_commands(&self, messages: &MessageState, now: i64) -> Vec<Command> {
        let mut commands = Vec::new();
        messages.visit_messages_with_deadline_before(now, |stored| {
            commands.push(Command::new(
                stored.key,
                CommandBody::DeleteMessage(stored.message.clone()),
            ));
            commands.len() < self.batch_size
        });

        if !commands.is_empty() {
            debug!(expired = commands.len(), "Found expired messages");
        }
        commands
    }
}
