// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Channels are kept in a pool keyed by name. Each entry is a [`LogicalChannel`]:
//! a stable handle wrapping the current transport channel, which gets replaced
//! in place when the broker closes or fails the channel. Subscribers of the
//! logical channel learn about failures and recreations through
//! [`ChannelEvent`]s and never hold on to a dead transport channel.

use crate::{
    connection::ConnectionSupervisor,
    errors::AmqpError,
    transport::{ChannelHandle, ChannelSignal},
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, error, info, warn};

/// Key of the channel opened with every connection
pub const DEFAULT_CHANNEL: &str = "default";

const EVENTS_CAPACITY: usize = 64;

/// Flow control of a channel. Without an explicit prefetch the supervisor's
/// default applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub prefetch: Option<u16>,
    pub global: bool,
}

impl ChannelOptions {
    /// Options with an explicit prefetch.
    ///
    /// # Parameters
    /// * `count` - Maximum number of unacknowledged deliveries
    /// * `global` - Whether the limit applies to the whole channel rather than per consumer
    pub fn prefetch(count: u16, global: bool) -> Self {
        ChannelOptions {
            prefetch: Some(count),
            global,
        }
    }
}

/// What happened to the transport channel behind a [`LogicalChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The broker reported a channel error
    Error(String),
    Closed,
    /// A new transport channel replaced the failed one
    Reconnected,
    /// The channel stays down: it is not recreated, or recreating it failed
    Failed(AmqpError),
}

pub struct LogicalChannel {
    me: Weak<LogicalChannel>,
    key: String,
    supervisor: Weak<ConnectionSupervisor>,
    options: ChannelOptions,
    inner: RwLock<Option<ChannelHandle>>,
    prefetch: Mutex<Option<(u16, bool)>>,
    generation: AtomicU64,
    connected: AtomicBool,
    recreating: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

impl LogicalChannel {
    pub(crate) fn new(
        key: &str,
        supervisor: Weak<ConnectionSupervisor>,
        options: ChannelOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Arc::new_cyclic(|me| LogicalChannel {
            me: me.clone(),
            key: key.to_owned(),
            supervisor,
            options,
            inner: RwLock::new(None),
            prefetch: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            recreating: AtomicBool::new(false),
            events,
        })
    }

    /// Opens a transport channel on the current connection and applies the
    /// prefetch: the one last set, else the configured one, else the
    /// supervisor's default.
    pub async fn create(&self) -> Result<ChannelHandle, AmqpError> {
        let supervisor = self.supervisor.upgrade().ok_or(AmqpError::NotConnected)?;
        let connection = supervisor.connection().ok_or(AmqpError::NotConnected)?;

        debug!(key = self.key.as_str(), "creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), key = self.key.as_str(), "error to create the channel");
            err
        })?;
        self.install(channel.clone());

        let last = *self.prefetch.lock();
        let (count, global) = last.unwrap_or((
            self.options.prefetch.unwrap_or_else(|| supervisor.default_prefetch()),
            self.options.global,
        ));
        self.set_prefetch(count, global).await?;

        debug!(key = self.key.as_str(), "channel created");
        Ok(channel)
    }

    /// Applies and remembers the prefetch, so a recreated channel gets it too.
    pub async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        let channel = self.channel().ok_or(AmqpError::ChannelNotCreated)?;
        channel.basic_qos(count, global).await?;
        *self.prefetch.lock() = Some((count, global));
        Ok(())
    }

    fn install(&self, channel: ChannelHandle) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.write() = Some(channel.clone());
        self.connected.store(true, Ordering::SeqCst);

        // driver callbacks may fire outside of the runtime
        let runtime = Handle::try_current().ok();
        let me = self.me.clone();
        channel.on_signal(Box::new(move |signal| {
            if let Some(channel) = me.upgrade() {
                channel.on_signal(generation, signal, runtime.as_ref());
            }
        }));
    }

    fn on_signal(&self, generation: u64, signal: ChannelSignal, runtime: Option<&Handle>) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(key = self.key.as_str(), "signal from a replaced channel");
            return;
        }

        self.connected.store(false, Ordering::SeqCst);
        match &signal {
            ChannelSignal::Error { message, .. } => {
                warn!(key = self.key.as_str(), error = message.as_str(), "channel error");
                self.emit(ChannelEvent::Error(message.clone()));
            }
            ChannelSignal::Closed => {
                debug!(key = self.key.as_str(), "channel closed");
                self.emit(ChannelEvent::Closed);
            }
        }

        if signal.is_not_found() {
            debug!(key = self.key.as_str(), "not found error, channel is not recreated");
            self.fail(&signal);
            return;
        }

        let can_create = self
            .supervisor
            .upgrade()
            .is_some_and(|supervisor| supervisor.can_create_channel());
        if !can_create {
            debug!(key = self.key.as_str(), "connection unusable, channel is not recreated");
            self.fail(&signal);
            return;
        }
        if self.recreating.swap(true, Ordering::SeqCst) {
            return;
        }

        match (runtime, self.me.upgrade()) {
            (Some(runtime), Some(channel)) => {
                runtime.spawn(async move { channel.recreate().await });
            }
            _ => self.recreating.store(false, Ordering::SeqCst),
        }
    }

    async fn recreate(&self) {
        info!(key = self.key.as_str(), "recreating channel");
        let result = self.create().await;
        self.recreating.store(false, Ordering::SeqCst);

        match result {
            Ok(_) => {
                info!(key = self.key.as_str(), "channel recreated");
                self.emit(ChannelEvent::Reconnected);
            }
            Err(err) => {
                error!(key = self.key.as_str(), error = err.to_string(), "failure to recreate channel");
                self.emit(ChannelEvent::Failed(AmqpError::ChannelFault(
                    self.key.clone(),
                    err.to_string(),
                )));
            }
        }
    }

    fn fail(&self, signal: &ChannelSignal) {
        let reason = match signal {
            ChannelSignal::Error { message, .. } => message.clone(),
            ChannelSignal::Closed => "channel closed".to_owned(),
        };
        self.emit(ChannelEvent::Failed(AmqpError::ChannelFault(self.key.clone(), reason)));
    }

    /// Name of the channel in the pool.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current transport channel, if one was ever created.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.inner.read().clone()
    }

    /// Whether the current transport channel is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Prefetch last applied, as `(count, global)`.
    pub fn prefetch(&self) -> Option<(u16, bool)> {
        *self.prefetch.lock()
    }

    /// Subscribes to the events of this channel.
    ///
    /// # Returns
    /// A receiver getting every [`ChannelEvent`] emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

/// Named logical channels of one supervisor.
pub struct ChannelPool {
    supervisor: Weak<ConnectionSupervisor>,
    channels: Mutex<HashMap<String, Arc<LogicalChannel>>>,
}

impl ChannelPool {
    pub(crate) fn new(supervisor: Weak<ConnectionSupervisor>) -> Self {
        ChannelPool {
            supervisor,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel stored under `key`, opening a new transport channel
    /// for it when it is disconnected. Unknown keys get a new entry.
    ///
    /// # Parameters
    /// * `key` - Name of the channel in the pool
    /// * `options` - Prefetch settings, only used for a new entry
    ///
    /// # Returns
    /// The pooled logical channel, the same instance for a given key
    pub async fn create(
        &self,
        key: &str,
        options: ChannelOptions,
    ) -> Result<Arc<LogicalChannel>, AmqpError> {
        if let Some(channel) = self.get(key) {
            if channel.is_connected() {
                debug!(key, "reusing channel");
            } else {
                debug!(key, "reopening disconnected channel");
                channel.create().await?;
            }
            return Ok(channel);
        }

        let channel = LogicalChannel::new(key, self.supervisor.clone(), options);
        channel.create().await?;
        self.channels.lock().insert(key.to_owned(), channel.clone());
        Ok(channel)
    }

    /// Like [`ChannelPool::create`] but meant for callers that expect the
    /// entry to usually exist already.
    pub async fn upsert(
        &self,
        key: &str,
        options: ChannelOptions,
    ) -> Result<Arc<LogicalChannel>, AmqpError> {
        match self.usable(key) {
            Some(channel) => Ok(channel),
            None => self.create(key, options).await,
        }
    }

    /// Looks up a pooled channel.
    ///
    /// # Parameters
    /// * `key` - Name of the channel
    ///
    /// # Returns
    /// The logical channel, or `None` for an unknown key
    pub fn get(&self, key: &str) -> Option<Arc<LogicalChannel>> {
        self.channels.lock().get(key).cloned()
    }

    /// Current transport channel of the pooled entry `key`.
    pub fn get_channel(&self, key: &str) -> Option<ChannelHandle> {
        self.get(key).and_then(|channel| channel.channel())
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    pub(crate) fn mark_disconnected(&self) {
        for channel in self.channels.lock().values() {
            channel.mark_disconnected();
        }
    }

    fn usable(&self, key: &str) -> Option<Arc<LogicalChannel>> {
        self.get(key).filter(|channel| channel.is_connected())
    }
}
