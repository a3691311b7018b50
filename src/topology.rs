// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and installing the topology a
//! service relies on: exchanges, queues with their bindings, and the handlers
//! consuming them. Installing happens in a fixed order:
//!
//! 1. every exchange is asserted or checked;
//! 2. every queue is asserted or checked on its channel, then bound;
//! 3. queues with handlers (or a queue-level handler) start consuming.
//!
//! Installing again after a reconnection is safe, declarations are idempotent
//! on the broker side.

use crate::{
    channel::{ChannelOptions, LogicalChannel, DEFAULT_CHANNEL},
    connection::ConnectionSupervisor,
    consumer::{ConsumeOptions, QueueConsumer},
    dispatcher::{HandlerRegistration, MessageRouter},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a handler to the topology, validating it first.
    fn handler(self, registration: HandlerRegistration) -> Result<Self, AmqpError>
    where
        Self: Sized;

    /// Installs the topology and starts the consumers.
    async fn install(
        &self,
        supervisor: &ConnectionSupervisor,
    ) -> Result<Vec<Arc<QueueConsumer>>, AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
#[derive(Debug, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) routers: HashMap<String, MessageRouter>,
    assert: bool,
    options: ConsumeOptions,
}

impl AmqpTopology {
    /// Creates an empty topology asserting its exchanges and queues unless
    /// they say otherwise.
    pub fn new() -> AmqpTopology {
        AmqpTopology {
            assert: true,
            ..Default::default()
        }
    }

    /// Default for definitions that leave `assert` unset.
    pub fn assert(mut self, assert: bool) -> Self {
        self.assert = assert;
        self
    }

    /// Sets how the consumers decode messages and report errors.
    ///
    /// # Parameters
    /// * `options` - Options shared by every consumer of the topology
    pub fn consume_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Asserts or checks one exchange on the default channel.
    pub async fn register_exchange(
        &self,
        supervisor: &ConnectionSupervisor,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        let channel = supervisor.default_channel().ok_or(AmqpError::NotConnected)?;

        if def.assert.unwrap_or(self.assert) {
            channel.exchange_declare(def).await?;
            debug!("exchange: {} was created", def.name);
        } else if def.check {
            channel.exchange_check(&def.name).await?;
            debug!("exchange: {} exists", def.name);
        }
        Ok(())
    }

    /// Asserts or checks one queue on its channel, then binds it.
    pub async fn register_queue(
        &self,
        supervisor: &ConnectionSupervisor,
        def: &QueueDefinition,
    ) -> Result<Arc<LogicalChannel>, AmqpError> {
        let (key, options) = match &def.channel {
            Some(settings) => (
                settings.key.as_str(),
                ChannelOptions {
                    prefetch: settings.prefetch,
                    global: settings.global,
                },
            ),
            None => (DEFAULT_CHANNEL, ChannelOptions::default()),
        };
        let logical = supervisor.channel_pool().upsert(key, options).await?;
        let channel = logical.channel().ok_or(AmqpError::ChannelNotCreated)?;

        if def.assert.unwrap_or(self.assert) {
            channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name);
        } else if def.check {
            channel.queue_check(&def.name).await?;
            debug!("queue: {} exists", def.name);
        }

        for binding in &def.binds {
            for routing_key in binding.routing_keys() {
                channel
                    .queue_bind(&def.name, &binding.exchange, routing_key)
                    .await?;
            }
        }

        Ok(logical)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn handler(mut self, registration: HandlerRegistration) -> Result<Self, AmqpError> {
        let queue = registration.queue().to_owned();
        self.routers.entry(queue).or_default().register(registration)?;
        Ok(self)
    }

    async fn install(
        &self,
        supervisor: &ConnectionSupervisor,
    ) -> Result<Vec<Arc<QueueConsumer>>, AmqpError> {
        for def in &self.exchanges {
            self.register_exchange(supervisor, def).await?;
        }

        for queue in self.routers.keys() {
            if !self.queues.iter().any(|def| def.name() == queue) {
                warn!(queue = queue.as_str(), "handlers registered for an undeclared queue");
            }
        }

        let mut consumers = vec![];
        for def in &self.queues {
            let channel = self.register_queue(supervisor, def).await?;

            let router = self.routers.get(def.name()).cloned().unwrap_or_default();
            if router.is_empty() && def.handler.is_none() {
                debug!(queue = def.name(), "no handler, queue is not consumed");
                continue;
            }

            let consumer = QueueConsumer::new(
                channel,
                def,
                Arc::new(router),
                supervisor.drain().clone(),
                self.options.clone(),
            );
            consumer.consume().await?;
            consumers.push(consumer);
        }

        Ok(consumers)
    }
}
