// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime hosting every partition in one process.
//!
//! Each partition runs as its own tokio task that exclusively owns a
//! [`Partition`] and serialises all work through a bounded inbox. The same
//! task runs the pending checkers and the TTL sweep on interval ticks, so
//! nothing else ever touches partition state. Cross-partition commands go
//! through [`PartitionRouter`], which `try_send`s into the target inbox and
//! never blocks the sending partition.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::record::MessageRecord;
//! use courier_core::runtime::Broker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Broker::builder().build()?.start()?;
//!
//!     let response = broker
//!         .publish_message(MessageRecord::new("order-placed", "order-123").with_time_to_live(60_000))
//!         .await?;
//!     println!("published message {}", response.key);
//!
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::command_sender::SubscriptionCommandSender;
use crate::config::Config;
use crate::error::{CoreError, Rejection};
use crate::event_scope::{EventScope, EventScopeRegistry};
use crate::key::{Key, PartitionId, START_PARTITION_ID, decode_partition_id, subscription_partition_id};
use crate::partition::Partition;
use crate::processor::catch_event::CatchEventSubscription;
use crate::record::{
    Command, CommandBody, CommandResponse, MessageRecord, MessageStartEventSubscriptionRecord,
    Record, WorkflowInstanceRecord,
};

/// Work item of a partition task.
pub(crate) enum PartitionRequest {
    /// Cross-partition command, nobody waits for the reply.
    Command(Command),
    /// Client command with a reply channel.
    Client {
        command: Command,
        reply: oneshot::Sender<CommandResponse>,
    },
    Subscribe {
        subscription: CatchEventSubscription,
        reply: oneshot::Sender<std::result::Result<(), Rejection>>,
    },
    Unsubscribe {
        element_instance_key: Key,
        reply: oneshot::Sender<usize>,
    },
    InstanceFinished {
        instance: WorkflowInstanceRecord,
        terminated: bool,
        reply: oneshot::Sender<crate::error::Result<Option<Key>>>,
    },
    Records {
        reply: oneshot::Sender<Vec<Record>>,
    },
}

/// [`SubscriptionCommandSender`] delivering into partition inboxes.
///
/// A full or closed inbox counts as not accepted.
#[derive(Clone)]
pub struct PartitionRouter {
    inboxes: Arc<HashMap<PartitionId, mpsc::Sender<PartitionRequest>>>,
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut partitions: Vec<_> = self.inboxes.keys().copied().collect();
        partitions.sort_unstable();
        f.debug_struct("PartitionRouter")
            .field("partitions", &partitions)
            .finish()
    }
}

impl SubscriptionCommandSender for PartitionRouter {
    fn send(&self, partition_id: PartitionId, command: Command) -> bool {
        let Some(inbox) = self.inboxes.get(&partition_id) else {
            warn!(partition_id, "No inbox for partition");
            return false;
        };
        match inbox.try_send(PartitionRequest::Command(command)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(partition_id, "Partition inbox full, command not accepted");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(partition_id, "Partition inbox closed, command not accepted");
                false
            }
        }
    }
}

/// Builder for creating a [`Broker`].
pub struct BrokerBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    event_scope: Option<Arc<dyn EventScope>>,
    command_sender: Option<Arc<dyn SubscriptionCommandSender>>,
}

impl std::fmt::Debug for BrokerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBuilder")
            .field("config", &self.config)
            .field("event_scope", &self.event_scope.as_ref().map(|_| "..."))
            .field("command_sender", &self.command_sender.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            clock: Arc::new(SystemClock),
            event_scope: None,
            command_sender: None,
        }
    }
}

impl BrokerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the number of partitions.
    ///
    /// Default: 3
    pub fn partition_count(mut self, partition_count: u32) -> Self {
        self.config.partition_count = partition_count;
        self
    }

    /// Set the time source for deadlines and sent times.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the execution-engine hook shared by all partitions.
    ///
    /// Default: an empty [`EventScopeRegistry`], which refuses every trigger.
    pub fn event_scope(mut self, event_scope: Arc<dyn EventScope>) -> Self {
        self.event_scope = Some(event_scope);
        self
    }

    /// Route cross-partition commands through `sender` instead of the
    /// partition inboxes.
    pub fn command_sender(mut self, sender: Arc<dyn SubscriptionCommandSender>) -> Self {
        self.command_sender = Some(sender);
        self
    }

    /// Build the broker configuration.
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<BrokerConfig> {
        let config = self.config;
        config.validate().map_err(CoreError::from)?;

        let event_scope: Arc<dyn EventScope> = match self.event_scope {
            Some(event_scope) => event_scope,
            None => Arc::new(EventScopeRegistry::new()),
        };

        Ok(BrokerConfig {
            config,
            clock: self.clock,
            event_scope,
            command_sender: self.command_sender,
        })
    }
}

/// Configuration for a [`Broker`].
pub struct BrokerConfig {
    config: Config,
    clock: Arc<dyn Clock>,
    event_scope: Arc<dyn EventScope>,
    command_sender: Option<Arc<dyn SubscriptionCommandSender>>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("config", &self.config)
            .field("event_scope", &"...")
            .finish()
    }
}

impl BrokerConfig {
    /// Start the broker, spawning one task per partition.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Broker> {
        let config = self.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut inboxes = HashMap::new();
        let mut receivers = Vec::new();
        for offset in 0..config.partition_count {
            let partition_id = START_PARTITION_ID + offset as PartitionId;
            let (tx, rx) = mpsc::channel(config.command_queue_capacity);
            inboxes.insert(partition_id, tx);
            receivers.push((partition_id, rx));
        }

        let router = PartitionRouter {
            inboxes: Arc::new(inboxes),
        };
        let sender: Arc<dyn SubscriptionCommandSender> = match self.command_sender {
            Some(sender) => sender,
            None => Arc::new(router.clone()),
        };

        let mut handles = Vec::with_capacity(receivers.len());
        for (partition_id, inbox) in receivers {
            let partition = Partition::new(
                partition_id,
                &config,
                sender.clone(),
                self.event_scope.clone(),
                self.clock.clone(),
            );
            handles.push(tokio::spawn(run_partition(
                partition,
                inbox,
                shutdown_rx.clone(),
                config.subscription_check_interval,
                config.message_ttl_check_interval,
            )));
        }

        info!(
            partition_count = config.partition_count,
            subscription_timeout_ms = config.subscription_timeout.as_millis() as u64,
            "Broker started"
        );

        Ok(Broker {
            router,
            handles,
            shutdown_tx,
            partition_count: config.partition_count,
        })
    }
}

/// A running set of partitions.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Broker {
    router: PartitionRouter,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    partition_count: u32,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("partition_count", &self.partition_count)
            .finish()
    }
}

impl Broker {
    /// Create a new builder for configuring the broker.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Sender delivering into this broker's partitions.
    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    /// Publish a message on the partition of its correlation key.
    pub async fn publish_message(&self, message: MessageRecord) -> crate::error::Result<CommandResponse> {
        let partition_id = subscription_partition_id(&message.correlation_key, self.partition_count);
        let command = Command::unkeyed(CommandBody::PublishMessage(message));
        self.request(partition_id, |reply| PartitionRequest::Client { command, reply })
            .await
    }

    /// Open message start event subscriptions of a deployed workflow on every
    /// partition.
    pub async fn deploy_message_start_events(
        &self,
        subscriptions: Vec<MessageStartEventSubscriptionRecord>,
    ) -> crate::error::Result<()> {
        for partition_id in self.partition_ids() {
            for subscription in &subscriptions {
                let command = Command::unkeyed(CommandBody::OpenMessageStartEventSubscription(
                    subscription.clone(),
                ));
                let response = self
                    .request(partition_id, |reply| PartitionRequest::Client { command, reply })
                    .await?;
                if let Some(rejection) = response.rejection {
                    return Err(CoreError::Rejected(rejection));
                }
            }
        }
        Ok(())
    }

    /// Close the message start event subscriptions of a workflow on every
    /// partition. Returns whether any partition held one.
    pub async fn close_message_start_events(&self, workflow_key: Key) -> crate::error::Result<bool> {
        let mut closed = false;
        for partition_id in self.partition_ids() {
            let command = Command::unkeyed(CommandBody::CloseMessageStartEventSubscription(
                MessageStartEventSubscriptionRecord {
                    workflow_key,
                    bpmn_process_id: String::new(),
                    start_event_id: String::new(),
                    message_name: String::new(),
                },
            ));
            let response = self
                .request(partition_id, |reply| PartitionRequest::Client { command, reply })
                .await?;
            closed |= !response.is_rejected();
        }
        Ok(closed)
    }

    /// Subscribe a catch event on the partition of its workflow instance.
    pub async fn subscribe(&self, subscription: CatchEventSubscription) -> crate::error::Result<()> {
        let partition_id = decode_partition_id(subscription.workflow_instance_key);
        self.request(partition_id, |reply| PartitionRequest::Subscribe {
            subscription,
            reply,
        })
        .await?
        .map_err(CoreError::Rejected)
    }

    /// Close every subscription of an element instance.
    pub async fn unsubscribe(
        &self,
        partition_id: PartitionId,
        element_instance_key: Key,
    ) -> crate::error::Result<usize> {
        self.request(partition_id, |reply| PartitionRequest::Unsubscribe {
            element_instance_key,
            reply,
        })
        .await
    }

    /// Report a finished workflow instance to the partition that started it.
    ///
    /// Returns the instance started from a buffered message, if any.
    pub async fn workflow_instance_finished(
        &self,
        instance: WorkflowInstanceRecord,
        terminated: bool,
    ) -> crate::error::Result<Option<Key>> {
        let partition_id = decode_partition_id(instance.workflow_instance_key);
        self.request(partition_id, |reply| PartitionRequest::InstanceFinished {
            instance,
            terminated,
            reply,
        })
        .await?
    }

    /// Snapshot of a partition log.
    pub async fn records(&self, partition_id: PartitionId) -> crate::error::Result<Vec<Record>> {
        self.request(partition_id, |reply| PartitionRequest::Records { reply })
            .await
    }

    /// Gracefully shut down every partition task.
    pub async fn shutdown(self) -> Result<()> {
        info!("Broker shutting down...");

        let _ = self.shutdown_tx.send(true);

        let mut failed = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Partition task panicked: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow::anyhow!("{failed} partition task(s) panicked"));
        }

        info!("Broker shutdown complete");
        Ok(())
    }

    /// Check if every partition task is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|handle| !handle.is_finished())
    }

    fn partition_ids(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.partition_count).map(|offset| START_PARTITION_ID + offset as PartitionId)
    }

    async fn request<T>(
        &self,
        partition_id: PartitionId,
        build: impl FnOnce(oneshot::Sender<T>) -> PartitionRequest,
    ) -> crate::error::Result<T> {
        let inbox = self
            .router
            .inboxes
            .get(&partition_id)
            .ok_or(CoreError::PartitionUnavailable(partition_id))?;
        let (reply, response) = oneshot::channel();
        inbox
            .send(build(reply))
            .await
            .map_err(|_| CoreError::PartitionUnavailable(partition_id))?;
        response
            .await
            .map_err(|_| CoreError::ResponseDropped(partition_id))
    }
}

/// Partition task: serves the inbox and runs the periodic checkers until
/// shutdown.
async fn run_partition(
    mut partition: Partition,
    mut inbox: mpsc::Receiver<PartitionRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
    check_interval: Duration,
    ttl_interval: Duration,
) {
    let partition_id = partition.partition_id();
    let start = Instant::now();
    let mut subscription_check = tokio::time::interval_at(start + check_interval, check_interval);
    subscription_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ttl_check = tokio::time::interval_at(start + ttl_interval, ttl_interval);
    ttl_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(partition_id, "Partition started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(partition_id, "Partition received shutdown signal");
                    break;
                }
            }

            request = inbox.recv() => {
                match request {
                    Some(request) => handle_request(&mut partition, request),
                    None => break,
                }
            }

            _ = subscription_check.tick() => {
                partition.check_pending_subscriptions();
            }

            _ = ttl_check.tick() => {
                partition.check_message_ttl();
            }
        }
    }

    info!(partition_id, "Partition stopped");
}

fn handle_request(partition: &mut Partition, request: PartitionRequest) {
    match request {
        PartitionRequest::Command(command) => {
            let outcome = partition.process(command);
            outcome.side_effects.execute();
        }
        PartitionRequest::Client { command, reply } => {
            let outcome = partition.process(command);
            if let Some(response) = outcome.response {
                let _ = reply.send(response);
            }
            outcome.side_effects.execute();
        }
        PartitionRequest::Subscribe {
            subscription,
            reply,
        } => {
            let _ = reply.send(partition.subscribe(&subscription));
        }
        PartitionRequest::Unsubscribe {
            element_instance_key,
            reply,
        } => {
            let _ = reply.send(partition.unsubscribe(element_instance_key));
        }
        PartitionRequest::InstanceFinished {
            instance,
            terminated,
            reply,
        } => {
            let _ = reply.send(partition.workflow_instance_finished(instance, terminated));
        }
        PartitionRequest::Records { reply } => {
            let _ = reply.send(partition.records().to_vec());
        }
    }
}
