// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shutdown Drain Coordinator
//!
//! Keeps track of the active consumers and of every message between its
//! receipt and the moment its result is applied. On shutdown all consumers are
//! cancelled, then the coordinator waits for the in-flight messages to settle
//! (or for a cancellation, or for the timeout) before closing the connection.

use crate::{
    connection::ConnectionSupervisor, errors::AmqpError, message::InboundMessage,
    transport::ChannelHandle,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A consume call that succeeded on a channel.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub channel: ChannelHandle,
    pub tag: String,
}

impl fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("tag", &self.tag)
            .finish()
    }
}

/// A message received and not yet settled.
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub id: Uuid,
    pub message: InboundMessage,
}

#[derive(Default)]
struct DrainState {
    consumers: Vec<ConsumerRegistration>,
    messages: HashMap<Uuid, InFlightMessage>,
}

enum DrainOutcome {
    Drained,
    Cancelled,
    TimedOut,
}

pub struct DrainCoordinator {
    state: Mutex<DrainState>,
    in_flight: watch::Sender<usize>,
    running: AtomicBool,
    cancel: Notify,
    timeout: Duration,
}

impl DrainCoordinator {
    /// Creates a coordinator.
    ///
    /// # Parameters
    /// * `timeout` - How long a shutdown waits for in-flight messages
    pub fn new(timeout: Duration) -> Self {
        let (in_flight, _) = watch::channel(0);

        DrainCoordinator {
            state: Mutex::new(DrainState::default()),
            in_flight,
            running: AtomicBool::new(false),
            cancel: Notify::new(),
            timeout,
        }
    }

    /// Records a consume call, cancelled on shutdown.
    pub fn add_consumer(&self, channel: ChannelHandle, tag: &str) {
        debug!(tag, "new consumer tag");
        self.state.lock().consumers.push(ConsumerRegistration {
            channel,
            tag: tag.to_owned(),
        });
    }

    pub fn remove_consumer(&self, tag: &str) {
        self.state.lock().consumers.retain(|consumer| consumer.tag != tag);
    }

    pub fn consumers(&self) -> Vec<ConsumerRegistration> {
        self.state.lock().consumers.clone()
    }

    /// Tracks a received message and returns its in-flight identifier.
    pub fn add_message(&self, message: &InboundMessage) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock();
        state.messages.insert(
            id,
            InFlightMessage {
                id,
                message: message.clone(),
            },
        );
        self.in_flight.send_replace(state.messages.len());
        id
    }

    pub fn remove_message(&self, id: &Uuid) {
        let mut state = self.state.lock();
        state.messages.remove(id);
        let left = state.messages.len();
        self.in_flight.send_replace(left);
        debug!(%id, left, "message settled");
    }

    /// Whether messages are still in flight.
    pub fn has_messages(&self) -> bool {
        *self.in_flight.borrow() > 0
    }

    pub fn is_shutdown_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops an ongoing drain; the pending `shutdown` returns without closing.
    pub fn cancel_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    /// Cancels every consumer, drains in-flight messages and closes the
    /// connection. Does nothing when a shutdown is already running.
    pub async fn shutdown(&self, connection: &ConnectionSupervisor) -> Result<(), AmqpError> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("shutdown already running");
            return Ok(());
        }

        let consumers = self.consumers();
        debug!(count = consumers.len(), "cancelling consumers");

        let cancelled = join_all(consumers.into_iter().map(|consumer| async move {
            debug!(tag = consumer.tag.as_str(), "cancelling consumer");
            if let Err(err) = consumer.channel.basic_cancel(&consumer.tag).await {
                warn!(
                    error = err.to_string(),
                    tag = consumer.tag.as_str(),
                    "failure to cancel consumer"
                );
            }
            self.remove_consumer(&consumer.tag);
        }))
        .await
        .len();

        let outcome = if cancelled == 0 {
            DrainOutcome::Drained
        } else {
            self.wait_for_drain().await
        };

        match outcome {
            DrainOutcome::Cancelled => {
                info!("shutdown cancelled");
                Ok(())
            }
            DrainOutcome::Drained => {
                self.running.store(false, Ordering::SeqCst);
                info!("closing connection");
                connection.close().await
            }
            DrainOutcome::TimedOut => {
                self.running.store(false, Ordering::SeqCst);
                warn!("shutdown timeout, closing connection anyway");
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "failure to close connection");
                }
                Err(AmqpError::ShutdownTimeout(self.timeout.as_millis()))
            }
        }
    }

    async fn wait_for_drain(&self) -> DrainOutcome {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if !self.is_shutdown_running() {
            return DrainOutcome::Cancelled;
        }

        let mut in_flight = self.in_flight.subscribe();

        tokio::select! {
            _ = in_flight.wait_for(|count| *count == 0) => {
                debug!("no more messages, complete shutdown");
                DrainOutcome::Drained
            }
            _ = &mut cancelled => DrainOutcome::Cancelled,
            _ = tokio::time::sleep(self.timeout) => DrainOutcome::TimedOut,
        }
    }
}
