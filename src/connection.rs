// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single broker connection. `connect` runs a fixed-delay retry loop
//! until the transport accepts the connection, the attempt budget is spent or
//! the supervisor is told to stop. Once connected it watches the connection for
//! errors and re-emits them as [`ConnectionEvent::Error`]; reconnecting is up
//! to whoever listens (see [`crate::runtime`]).
//!
//! Disconnected -> Connecting -> Connected -> (error) -> Disconnected

use crate::{
    channel::{ChannelOptions, ChannelPool, LogicalChannel, DEFAULT_CHANNEL},
    config::{ConnectionConfig, RetryConfig, DEFAULT_HOST, DEFAULT_PORT},
    drain::DrainCoordinator,
    errors::AmqpError,
    transport::{ChannelHandle, Transport, TransportConnection},
};
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Arc, Weak,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Prefetch applied when none (or an invalid one) is configured
pub const DEFAULT_PREFETCH: u16 = 10;

const EVENTS_CAPACITY: usize = 64;
const REDACTED: &str = "***";

/// Characters escaped in URI components.
const COMPONENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'/')
    .add(b':')
    .add(b'=')
    .add(b'?')
    .add(b'@');

/// Lifecycle events of the supervised connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Opened,
    Connected,
    Ready,
    Error(String),
}

pub struct ConnectionSupervisor {
    me: Weak<ConnectionSupervisor>,
    transport: Arc<dyn Transport>,
    uri: String,
    redacted_uri: String,
    retry: RetryConfig,
    connection: RwLock<Option<Arc<dyn TransportConnection>>>,
    default_channel: RwLock<Option<Arc<LogicalChannel>>>,
    connecting: AtomicBool,
    connected: AtomicBool,
    closing: AtomicBool,
    default_prefetch: AtomicU16,
    pool: ChannelPool,
    drain: Arc<DrainCoordinator>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionSupervisor {
    /// Creates a disconnected supervisor.
    ///
    /// # Parameters
    /// * `config` - Broker location, credentials, retry policy and default prefetch
    /// * `transport` - Driver used to open connections
    /// * `drain` - Coordinator consulted before recreating channels
    ///
    /// # Returns
    /// The supervisor, shared with the channels it owns
    pub fn new(
        config: &ConnectionConfig,
        transport: Arc<dyn Transport>,
        drain: Arc<DrainCoordinator>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        let supervisor = Arc::new_cyclic(|me: &Weak<ConnectionSupervisor>| ConnectionSupervisor {
            me: me.clone(),
            transport,
            uri: build_uri(config, false),
            redacted_uri: build_uri(config, true),
            retry: config.retry.clone(),
            connection: RwLock::new(None),
            default_channel: RwLock::new(None),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            default_prefetch: AtomicU16::new(DEFAULT_PREFETCH),
            pool: ChannelPool::new(me.clone()),
            drain,
            events,
        });

        supervisor.set_default_prefetch(config.default_prefetch);
        supervisor
    }

    /// Connects to the broker and opens the default channel.
    ///
    /// Resolves to `None` without doing anything when a connection attempt is
    /// already in progress.
    pub async fn connect(&self) -> Result<Option<Arc<dyn TransportConnection>>, AmqpError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("already connecting");
            return Ok(None);
        }

        self.closing.store(false, Ordering::SeqCst);
        info!(uri = self.redacted_uri.as_str(), "connecting");
        self.emit(ConnectionEvent::Connecting);

        match self.establish().await {
            Ok(connection) => {
                self.connected.store(true, Ordering::SeqCst);
                self.connecting.store(false, Ordering::SeqCst);
                info!("connected, rabbitmq ready");
                self.emit(ConnectionEvent::Connected);
                self.emit(ConnectionEvent::Ready);
                Ok(Some(connection))
            }
            Err(err) => {
                self.connecting.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let connection = self.open_connection().await?;

        *self.connection.write() = Some(connection.clone());
        self.handle_disconnection(&connection);
        self.emit(ConnectionEvent::Opened);

        debug!("creating default channel...");
        let channel = self
            .pool
            .create(DEFAULT_CHANNEL, ChannelOptions::default())
            .await?;
        *self.default_channel.write() = Some(channel);

        Ok(connection)
    }

    async fn open_connection(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let max_attempts = self.retry.maximum_attempts();
        let mut attempts: u64 = 0;

        loop {
            debug!("try to open connection...");

            let err = match self.transport.connect(&self.uri).await {
                Ok(connection) => return Ok(connection),
                Err(err) => err,
            };

            attempts += 1;
            warn!(
                error = err.to_string(),
                attempts,
                delay_ms = self.retry.delay,
                "failure to connect"
            );

            if max_attempts.is_some_and(|max| attempts >= max) || self.is_closing() {
                return Err(AmqpError::RetryLimitExceeded);
            }

            tokio::time::sleep(self.retry.delay()).await;

            if self.is_closing() {
                return Err(AmqpError::RetryLimitExceeded);
            }
        }
    }

    fn handle_disconnection(&self, connection: &Arc<dyn TransportConnection>) {
        let me = self.me.clone();
        connection.on_error(Box::new(move |err| {
            if let Some(supervisor) = me.upgrade() {
                supervisor.on_connection_error(err);
            }
        }));
    }

    fn on_connection_error(&self, err: String) {
        warn!(error = err.as_str(), "rabbitmq connection error");
        self.connected.store(false, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);
        self.pool.mark_disconnected();
        self.emit(ConnectionEvent::Error(err));
    }

    /// Marks the connection closed and closes the transport connection.
    ///
    /// Pooled channels are marked disconnected, the next `connect` opens them
    /// again on the new connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closing.store(true, Ordering::SeqCst);
        self.pool.mark_disconnected();

        let connection = self.connection.write().take();
        match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    /// Makes an ongoing retry loop give up after its current attempt.
    pub fn stop_connecting(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Falls back to [`DEFAULT_PREFETCH`] for absent or out of range values.
    pub fn set_default_prefetch(&self, prefetch: Option<i64>) -> &Self {
        let prefetch = prefetch
            .and_then(|value| u16::try_from(value).ok())
            .unwrap_or(DEFAULT_PREFETCH);
        self.default_prefetch.store(prefetch, Ordering::SeqCst);
        self
    }

    /// Prefetch of channels created without one.
    pub fn default_prefetch(&self) -> u16 {
        self.default_prefetch.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Channels may only be (re)created on a settled, open connection while
    /// nothing is shutting down.
    pub fn can_create_channel(&self) -> bool {
        self.is_connected()
            && !self.is_connecting()
            && !self.is_closing()
            && !self.drain.is_shutdown_running()
    }

    /// The open transport connection, if any.
    pub fn connection(&self) -> Option<Arc<dyn TransportConnection>> {
        self.connection.read().clone()
    }

    /// Transport channel of the default logical channel.
    pub fn default_channel(&self) -> Option<ChannelHandle> {
        self.default_channel
            .read()
            .as_ref()
            .and_then(|channel| channel.channel())
    }

    /// The logical channel opened with every connection.
    pub fn default_channel_manager(&self) -> Option<Arc<LogicalChannel>> {
        self.default_channel.read().clone()
    }

    pub fn channel_pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn drain(&self) -> &Arc<DrainCoordinator> {
        &self.drain
    }

    /// Connection URI, credentials included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connection URI with the password masked, safe for logs.
    pub fn redacted_uri(&self) -> &str {
        &self.redacted_uri
    }

    /// Subscribes to the connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// `amqp://[login:password@]host:port[/vhost][?params]`, or the explicit URI.
fn build_uri(config: &ConnectionConfig, redact: bool) -> String {
    if let Some(uri) = &config.uri {
        return if redact { redact_uri(uri) } else { uri.clone() };
    }

    let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    let credentials = match (&config.login, &config.password) {
        (Some(login), Some(password)) if !login.is_empty() && !password.is_empty() => {
            let password = if redact {
                REDACTED.to_owned()
            } else {
                encode(password)
            };
            format!("{}:{}@", encode(login), password)
        }
        _ => String::new(),
    };

    let vhost = match config.vhost.as_deref() {
        Some(vhost) if !vhost.is_empty() => format!("/{}", encode(vhost)),
        _ => String::new(),
    };

    let params = if config.params.is_empty() {
        String::new()
    } else {
        let query = config
            .params
            .iter()
            .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        format!("?{query}")
    };

    format!("amqp://{credentials}{host}:{port}{vhost}{params}")
}

fn encode(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT_ENCODE_SET).to_string()
}

/// Masks the password of the userinfo part of an explicit URI.
fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_owned();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let Some(at) = rest[..authority_end].rfind('@') else {
        return uri.to_owned();
    };
    let userinfo = &rest[..at];
    let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);

    format!("{scheme}://{user}:{REDACTED}{}", &rest[at..])
}
