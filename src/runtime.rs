// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Runtime
//!
//! Entry point tying the pieces together: connects through the supervisor,
//! installs the topology, and installs it again whenever the connection comes
//! back after an error. Shutdown goes through the drain coordinator.
//!
//! ```ignore
//! let runtime = RabbitMQRuntime::with_lapin(config, topology);
//! runtime.bootstrap().await?;
//! // ...
//! runtime.shutdown().await?;
//! ```

use crate::{
    channel::DEFAULT_CHANNEL,
    config::RabbitMQConfig,
    connection::{ConnectionEvent, ConnectionSupervisor},
    consumer::QueueConsumer,
    driver::LapinTransport,
    drain::DrainCoordinator,
    errors::AmqpError,
    publisher::MessagePublisher,
    topology::{AmqpTopology, Topology},
    transport::Transport,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

pub struct RabbitMQRuntime {
    supervisor: Arc<ConnectionSupervisor>,
    drain: Arc<DrainCoordinator>,
    topology: AmqpTopology,
    consumers: Mutex<Vec<Arc<QueueConsumer>>>,
    watching: AtomicBool,
}

impl RabbitMQRuntime {
    /// Creates a runtime, nothing happens before [`RabbitMQRuntime::bootstrap`].
    ///
    /// # Parameters
    /// * `config` - Connection and shutdown configuration
    /// * `transport` - Driver used to reach the broker
    /// * `topology` - Exchanges, queues and handlers to install
    ///
    /// # Returns
    /// The runtime, shared with its connection watcher
    pub fn new(
        config: RabbitMQConfig,
        transport: Arc<dyn Transport>,
        topology: AmqpTopology,
    ) -> Arc<Self> {
        let drain = Arc::new(DrainCoordinator::new(config.shutdown_timeout()));
        let supervisor = ConnectionSupervisor::new(&config.connection, transport, drain.clone());

        Arc::new(RabbitMQRuntime {
            supervisor,
            drain,
            topology: topology.assert(config.assert),
            consumers: Mutex::new(vec![]),
            watching: AtomicBool::new(false),
        })
    }

    /// Runtime over a `lapin` connection.
    pub fn with_lapin(config: RabbitMQConfig, topology: AmqpTopology) -> Arc<Self> {
        let transport = LapinTransport::new(config.connection.connection_name.clone());
        Self::new(config, transport, topology)
    }

    /// Connects, installs the topology and starts consuming.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.supervisor.connect().await?;
        self.install().await?;
        self.watch_connection();
        info!("rabbitmq runtime ready");
        Ok(())
    }

    async fn install(&self) -> Result<(), AmqpError> {
        let consumers = self.topology.install(&self.supervisor).await?;
        let previous = std::mem::replace(&mut *self.consumers.lock(), consumers);
        for consumer in previous {
            consumer.forget_consumer();
        }
        Ok(())
    }

    fn watch_connection(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.supervisor.subscribe();
        let me = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Error(err)) => {
                        let Some(runtime) = me.upgrade() else {
                            break;
                        };
                        if runtime.supervisor.is_closing() || runtime.drain.is_shutdown_running() {
                            continue;
                        }

                        warn!(error = err.as_str(), "connection lost, reconnecting");
                        if let Err(err) = runtime.reconnect().await {
                            error!(error = err.to_string(), "failure to reconnect");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        if self.supervisor.connect().await?.is_some() {
            self.install().await?;
            info!("rabbitmq runtime restored");
        }
        Ok(())
    }

    /// Cancels the consumers, drains in-flight messages and closes the
    /// connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        info!("starting shutdown procedure");
        self.drain.shutdown(&self.supervisor).await
    }

    /// Releases a running shutdown without closing the connection.
    pub fn cancel_shutdown(&self) {
        self.drain.cancel_shutdown();
    }

    /// Publisher on the default channel.
    pub fn publisher(&self) -> Option<Arc<MessagePublisher>> {
        self.publisher_on(DEFAULT_CHANNEL)
    }

    /// Publisher on a pooled channel.
    pub fn publisher_on(&self, key: &str) -> Option<Arc<MessagePublisher>> {
        self.supervisor
            .channel_pool()
            .get(key)
            .map(MessagePublisher::new)
    }

    /// Consumers started by the last install.
    pub fn consumers(&self) -> Vec<Arc<QueueConsumer>> {
        self.consumers.lock().clone()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn drain(&self) -> &Arc<DrainCoordinator> {
        &self.drain
    }
}
