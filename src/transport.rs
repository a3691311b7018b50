// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seams
//!
//! The wire protocol lives in the transport driver. These traits are the only
//! surface the runtime needs from it; [`crate::driver`] implements them on top
//! of `lapin`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{InboundMessage, MessageProperties},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Shared handle on a transport channel.
pub type ChannelHandle = Arc<dyn TransportChannel>;

/// Stream of deliveries produced by a consume call.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Callback invoked by the driver when a channel fails or closes.
pub type SignalHandler = Box<dyn Fn(ChannelSignal) + Send + Sync>;

/// Callback invoked by the driver when the connection fails.
pub type ConnectionErrorHandler = Box<dyn Fn(String) + Send + Sync>;

/// Channel level failure reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Error { message: String, not_found: bool },
    Closed,
}

impl ChannelSignal {
    /// Protocol "not found" errors point at a missing queue or exchange,
    /// recreating the channel would fail the same way.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChannelSignal::Error { not_found: true, .. })
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// An open broker connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<ChannelHandle, AmqpError>;

    fn on_error(&self, handler: ConnectionErrorHandler);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open broker channel. Operations on one channel are serialized by the
/// driver, distinct channels run independently.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn basic_qos(&self, count: u16, global: bool) -> Result<(), AmqpError>;

    /// Starts a consumer and returns the broker issued tag with its deliveries.
    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn exchange_check(&self, name: &str) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_check(&self, name: &str) -> Result<(), AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError>;

    fn on_signal(&self, handler: SignalHandler);

    async fn close(&self) -> Result<(), AmqpError>;
}
