// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`QueueConsumer`] consumes one queue on one logical channel. Every delivery
//! is tracked by the drain coordinator from receipt until its result has been
//! applied, decoded, routed through the queue's [`MessageRouter`] and settled
//! according to the returned [`DispatchResult`]. Each message runs in its own
//! task, so a slow handler never blocks the deliveries behind it beyond the
//! channel prefetch.
//!
//! Failures (decode, routing, handler) reject the message without requeue,
//! except while a shutdown is running: the message is then requeued so another
//! instance picks it up. When the channel is recreated the consumer starts
//! consuming again on the new channel.

use crate::{
    channel::{ChannelEvent, LogicalChannel},
    dispatcher::{MessageHandler, MessageRouter},
    drain::DrainCoordinator,
    errors::AmqpError,
    message::{DispatchResult, InboundMessage},
    otel,
    queue::QueueDefinition,
    transport::{ChannelHandle, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use parking_lot::Mutex;
use std::{
    borrow::Cow,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Callback receiving the error and the message that caused it, before the
/// message is rejected.
pub type ErrorHandler = Arc<dyn Fn(&AmqpError, &InboundMessage) + Send + Sync>;

/// How deliveries are turned into messages before routing.
#[derive(Clone)]
pub struct ConsumeOptions {
    /// Decode JSON payloads before dispatch
    pub decode_message_content: bool,
    /// Decode every payload as JSON regardless of the `json` header
    pub force_json_decode: bool,
    pub error_handler: Option<ErrorHandler>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            decode_message_content: true,
            force_json_decode: false,
            error_handler: None,
        }
    }
}

impl fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("decode_message_content", &self.decode_message_content)
            .field("force_json_decode", &self.force_json_decode)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

pub struct QueueConsumer {
    me: Weak<QueueConsumer>,
    queue: String,
    channel: Arc<LogicalChannel>,
    router: Arc<MessageRouter>,
    fallback: Option<Arc<dyn MessageHandler>>,
    drain: Arc<DrainCoordinator>,
    force_json_decode: bool,
    options: ConsumeOptions,
    tracer: BoxedTracer,
    consumer_tag: Mutex<Option<String>>,
    watching: AtomicBool,
}

impl QueueConsumer {
    /// Creates a consumer, nothing is consumed before [`QueueConsumer::consume`].
    ///
    /// # Parameters
    /// * `channel` - Logical channel to consume on
    /// * `queue` - Queue definition, providing the name, JSON decoding and the queue handler
    /// * `router` - Handlers registered for the queue
    /// * `drain` - Coordinator tracking the consumer tag and in-flight messages
    /// * `options` - Decoding and error reporting options
    pub fn new(
        channel: Arc<LogicalChannel>,
        queue: &QueueDefinition,
        router: Arc<MessageRouter>,
        drain: Arc<DrainCoordinator>,
        options: ConsumeOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| QueueConsumer {
            me: me.clone(),
            queue: queue.name().to_owned(),
            channel,
            router,
            fallback: queue.handler.clone(),
            drain,
            force_json_decode: queue.force_json_decode || options.force_json_decode,
            options,
            tracer: global::tracer("amqp consumer"),
            consumer_tag: Mutex::new(None),
            watching: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Tag of the active consume call, if any.
    pub fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.lock().clone()
    }

    /// Starts consuming the queue and follows the channel from now on.
    pub async fn consume(&self) -> Result<String, AmqpError> {
        if !self.watching.swap(true, Ordering::SeqCst) {
            self.watch_channel();
        }
        self.start().await
    }

    async fn start(&self) -> Result<String, AmqpError> {
        let channel = self.channel.channel().ok_or(AmqpError::ChannelNotCreated)?;

        debug!(queue = self.queue.as_str(), "consuming queue...");
        let (tag, deliveries) = channel.basic_consume(&self.queue).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue.as_str(), "failure to consume");
            err
        })?;

        self.drain.add_consumer(channel.clone(), &tag);
        *self.consumer_tag.lock() = Some(tag.clone());

        tokio::spawn(Self::receive(self.me.clone(), channel, deliveries));

        Ok(tag)
    }

    fn watch_channel(&self) {
        let mut events = self.channel.subscribe();
        let me = self.me.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(consumer) = me.upgrade() else {
                            break;
                        };
                        consumer.on_channel_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "channel events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        self.forget_consumer();

        if event != ChannelEvent::Reconnected || self.drain.is_shutdown_running() {
            return;
        }

        if let Err(err) = self.start().await {
            error!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                "failure to consume on recreated channel"
            );
        }
    }

    /// Drops the consumer tag from the drain, the consume call is gone.
    pub(crate) fn forget_consumer(&self) {
        if let Some(tag) = self.consumer_tag.lock().take() {
            debug!(tag = tag.as_str(), "consumer tag removed");
            self.drain.remove_consumer(&tag);
        }
    }

    async fn receive(me: Weak<Self>, channel: ChannelHandle, mut deliveries: DeliveryStream) {
        while let Some(result) = deliveries.next().await {
            let Some(consumer) = me.upgrade() else {
                break;
            };

            match result {
                Ok(message) => {
                    // tracked before the task runs, a drain must see it
                    let id = consumer.drain.add_message(&message);
                    let channel = channel.clone();
                    tokio::spawn(async move { consumer.handle(id, message, channel).await });
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!("delivery stream ended");
    }

    async fn handle(&self, id: Uuid, message: InboundMessage, channel: ChannelHandle) {
        let (_ctx, mut span) = otel::new_span(&message.properties.headers, &self.tracer, &self.queue);

        debug!(
            queue = self.queue.as_str(),
            delivery_tag = message.fields.delivery_tag,
            exchange = message.fields.exchange.as_str(),
            routing_key = message.fields.routing_key.as_str(),
            "received"
        );

        let outcome = match self.process(&message, &channel).await {
            Ok(result) => self.settle(&message, result, &channel).await,
            Err(err) => {
                span.record_error(&err);
                self.handle_error(&message, &err, &channel).await
            }
        };

        match outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(error = err.to_string(), "failure to settle message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        self.drain.remove_message(&id);
    }

    async fn process(
        &self,
        message: &InboundMessage,
        channel: &ChannelHandle,
    ) -> Result<DispatchResult, AmqpError> {
        let message = if self.options.decode_message_content {
            message.clone().decode(self.force_json_decode)?
        } else {
            message.clone()
        };

        if let Some(dispatch) = self.router.dispatch(&message)? {
            debug!(handler = dispatch.handler_name(), "dispatching message");
            return dispatch.invoke(&message, channel).await;
        }

        match &self.fallback {
            Some(handler) => handler.on_message(&message, channel).await,
            None => {
                debug!(queue = self.queue.as_str(), "message not dispatched, acking");
                Ok(DispatchResult::Ack)
            }
        }
    }

    async fn settle(
        &self,
        message: &InboundMessage,
        result: DispatchResult,
        channel: &ChannelHandle,
    ) -> Result<(), AmqpError> {
        let tag = message.fields.delivery_tag;

        match result {
            DispatchResult::Ack | DispatchResult::Ignore => channel.basic_ack(tag).await,
            DispatchResult::Reject { requeue } => channel.basic_reject(tag, requeue).await,
            DispatchResult::Defer => {
                debug!(delivery_tag = tag, "settlement deferred to handler");
                Ok(())
            }
        }
    }

    async fn handle_error(
        &self,
        message: &InboundMessage,
        err: &AmqpError,
        channel: &ChannelHandle,
    ) -> Result<(), AmqpError> {
        let tag = message.fields.delivery_tag;

        if self.drain.is_shutdown_running() {
            warn!(
                error = err.to_string(),
                delivery_tag = tag,
                "failure during shutdown, requeuing message"
            );
            return channel.basic_reject(tag, true).await;
        }

        match &self.options.error_handler {
            Some(handler) => handler(err, message),
            None => error!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                delivery_tag = tag,
                "failure to handle message"
            ),
        }

        channel.basic_reject(tag, false).await
    }
}
