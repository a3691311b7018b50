// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory transport used by the unit tests.

use crate::{
    config::{ConnectionConfig, RetryConfig},
    connection::ConnectionSupervisor,
    drain::DrainCoordinator,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{InboundMessage, MessageProperties},
    queue::QueueDefinition,
    transport::{
        ChannelHandle, ChannelSignal, ConnectionErrorHandler, DeliveryStream, SignalHandler,
        Transport, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tokio::sync::mpsc;

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Qos(u16, bool),
    Consume(String),
    ConsumeRefused(String),
    Ack(u64),
    Reject(u64, bool),
    Cancel(String),
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: MessageProperties,
    },
    DeclareExchange(String),
    CheckExchange(String),
    DeclareQueue(String),
    CheckQueue(String),
    Bind(String, String, String),
    Close,
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    calls: Mutex<Vec<Call>>,
    signal: Mutex<Option<SignalHandler>>,
    deliveries: Mutex<Vec<mpsc::UnboundedSender<Result<InboundMessage, AmqpError>>>>,
    fail_consume: AtomicBool,
    fail_declare: AtomicBool,
}

impl FakeChannel {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn qos(&self) -> Vec<(u16, bool)> {
        self.filter(|call| match call {
            Call::Qos(count, global) => Some((*count, *global)),
            _ => None,
        })
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.filter(|call| match call {
            Call::Ack(tag) => Some(*tag),
            _ => None,
        })
    }

    pub(crate) fn rejects(&self) -> Vec<(u64, bool)> {
        self.filter(|call| match call {
            Call::Reject(tag, requeue) => Some((*tag, *requeue)),
            _ => None,
        })
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.filter(|call| match call {
            Call::Cancel(tag) => Some(tag.clone()),
            _ => None,
        })
    }

    pub(crate) fn consumed(&self) -> Vec<String> {
        self.filter(|call| match call {
            Call::Consume(queue) => Some(queue.clone()),
            _ => None,
        })
    }

    pub(crate) fn fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_declare(&self, fail: bool) {
        self.fail_declare.store(fail, Ordering::SeqCst);
    }

    /// Raises a signal as the driver would.
    pub(crate) fn emit(&self, signal: ChannelSignal) {
        if let Some(handler) = self.signal.lock().as_ref() {
            handler(signal);
        }
    }

    /// Pushes a delivery to the most recent consumer.
    pub(crate) fn deliver(&self, message: InboundMessage) {
        if let Some(sender) = self.deliveries.lock().last() {
            let _ = sender.send(Ok(message));
        }
    }

    fn filter<T>(&self, f: impl Fn(&Call) -> Option<T>) -> Vec<T> {
        self.calls.lock().iter().filter_map(f).collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TransportChannel for FakeChannel {
    async fn basic_qos(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.record(Call::Qos(count, global));
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), AmqpError> {
        if self.fail_consume.load(Ordering::SeqCst) {
            self.record(Call::ConsumeRefused(queue.to_owned()));
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }
        self.record(Call::Consume(queue.to_owned()));

        let n = NEXT_TAG.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.deliveries.lock().push(sender);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();

        Ok((format!("ctag-{queue}-{n}"), deliveries))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(Call::Reject(delivery_tag, requeue));
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(Call::Cancel(consumer_tag.to_owned()));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.record(Call::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if self.fail_declare.load(Ordering::SeqCst) {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }
        self.record(Call::DeclareExchange(def.name().to_owned()));
        Ok(())
    }

    async fn exchange_check(&self, name: &str) -> Result<(), AmqpError> {
        self.record(Call::CheckExchange(name.to_owned()));
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if self.fail_declare.load(Ordering::SeqCst) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }
        self.record(Call::DeclareQueue(def.name().to_owned()));
        Ok(())
    }

    async fn queue_check(&self, name: &str) -> Result<(), AmqpError> {
        self.record(Call::CheckQueue(name.to_owned()));
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.record(Call::Bind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    fn on_signal(&self, handler: SignalHandler) {
        *self.signal.lock() = Some(handler);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.record(Call::Close);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnection {
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    error_handler: Mutex<Option<ConnectionErrorHandler>>,
    fail_channels: AtomicBool,
    fail_consume: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub(crate) fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.channels.lock()[index].clone()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn fail_channels(&self, fail: bool) {
        self.fail_channels.store(fail, Ordering::SeqCst);
    }

    /// Channels opened from now on refuse consume calls.
    pub(crate) fn fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    /// Raises a connection error as the driver would.
    pub(crate) fn fail(&self, err: &str) {
        if let Some(handler) = self.error_handler.lock().as_ref() {
            handler(err.to_owned());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn create_channel(&self) -> Result<ChannelHandle, AmqpError> {
        if self.fail_channels.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closing".to_owned()));
        }
        let channel = Arc::new(FakeChannel::default());
        channel.fail_consume(self.fail_consume.load(Ordering::SeqCst));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn on_error(&self, handler: ConnectionErrorHandler) {
        *self.error_handler.lock() = Some(handler);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    failures: AtomicU32,
    attempts: AtomicU32,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    /// Refuses the first `failures` connection attempts.
    pub(crate) fn failing(failures: u32) -> Self {
        FakeTransport {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recent connection.
    pub(crate) fn connection(&self) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection opened")
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::ConnectionAttemptError("ECONNREFUSED".to_owned()));
        }

        let connection = Arc::new(FakeConnection::default());
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Supervisor over `transport` retrying 3 times, 10ms apart.
pub(crate) fn supervisor(
    transport: Arc<FakeTransport>,
    drain: Arc<DrainCoordinator>,
) -> Arc<ConnectionSupervisor> {
    let config = ConnectionConfig {
        retry: RetryConfig {
            delay: 10,
            maximum_attempts: 3,
        },
        ..Default::default()
    };
    ConnectionSupervisor::new(&config, transport, drain)
}

/// Yields to the spawned tasks until `condition` holds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never met");
}
