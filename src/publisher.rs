// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes on a pooled logical channel, so publishing keeps working after the
//! channel has been recreated. Payloads are JSON encoded by default and flagged
//! with the `json` header consumers decode on; the current OpenTelemetry
//! context is propagated in the headers.

use crate::{
    channel::LogicalChannel,
    errors::AmqpError,
    message::{MessageProperties, JSON_HEADER},
    otel,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub json: bool,
    pub properties: MessageProperties,
}

impl PublishMessage {
    /// JSON encodes `payload`. `null` and empty strings are refused.
    pub fn json<T: Serialize + ?Sized>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Self, AmqpError> {
        let value =
            serde_json::to_value(payload).map_err(|err| AmqpError::PublishingError(err.to_string()))?;
        if is_empty(&value) {
            return Err(AmqpError::EmptyMessageError);
        }
        let data =
            serde_json::to_vec(&value).map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        Ok(PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data,
            json: true,
            properties: MessageProperties::default(),
        })
    }

    /// Publishes `data` as is.
    pub fn raw(exchange: &str, routing_key: &str, data: &[u8]) -> Result<Self, AmqpError> {
        if data.is_empty() {
            return Err(AmqpError::EmptyMessageError);
        }

        Ok(PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            json: false,
            properties: MessageProperties::default(),
        })
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Adds a header to the message.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Header value, converted to an AMQP value when published
    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Sets the `type` property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.properties.kind = Some(kind.to_owned());
        self
    }

    /// Final properties: `json` header, content type, message id and trace
    /// context filled in when missing.
    fn outgoing_properties(&self) -> MessageProperties {
        let mut properties = self.properties.clone();

        properties
            .headers
            .entry(JSON_HEADER)
            .or_insert(Value::Bool(self.json));
        if self.json && properties.content_type.is_none() {
            properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
        }
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }
        otel::inject_context(&mut properties.headers);

        properties
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(value) => value.is_empty(),
        _ => false,
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &PublishMessage) -> Result<(), AmqpError>;
}

/// Publisher bound to one logical channel.
pub struct MessagePublisher {
    channel: Arc<LogicalChannel>,
}

impl MessagePublisher {
    /// Creates a publisher.
    ///
    /// # Parameters
    /// * `channel` - Logical channel messages are published on
    pub fn new(channel: Arc<LogicalChannel>) -> Arc<MessagePublisher> {
        Arc::new(MessagePublisher { channel })
    }

    /// Publishes a JSON payload straight to `queue` through the default
    /// exchange.
    pub async fn send_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
    ) -> Result<(), AmqpError> {
        self.publish(&PublishMessage::json("", queue, payload)?).await
    }
}

#[async_trait]
impl Publisher for MessagePublisher {
    async fn publish(&self, message: &PublishMessage) -> Result<(), AmqpError> {
        let Some(channel) = self.channel.channel() else {
            error!(key = self.channel.key(), "publishing on a channel never created");
            return Err(AmqpError::ChannelNotCreated);
        };

        debug!(
            exchange = message.exchange.as_str(),
            routing_key = message.routing_key.as_str(),
            "publishing message"
        );

        channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                &message.data,
                &message.outgoing_properties(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drain::DrainCoordinator,
        fakes::{supervisor, Call, FakeTransport},
    };
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn refuses_empty_payloads() {
        assert_eq!(
            PublishMessage::json("", "q", &Value::Null),
            Err(AmqpError::EmptyMessageError)
        );
        assert_eq!(PublishMessage::json("", "q", ""), Err(AmqpError::EmptyMessageError));
        assert_eq!(PublishMessage::raw("", "q", b""), Err(AmqpError::EmptyMessageError));
        assert!(PublishMessage::json("", "q", &0).is_ok());
    }

    #[test]
    fn fills_missing_properties() {
        let message = PublishMessage::json("orders", "order.created", &json!({ "id": 1 }))
            .unwrap()
            .kind("order.created");
        let properties = message.outgoing_properties();

        assert_eq!(properties.headers.get(JSON_HEADER), Some(&Value::Bool(true)));
        assert_eq!(properties.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(properties.kind.as_deref(), Some("order.created"));
        assert!(properties.message_id.is_some());

        let raw = PublishMessage::raw("logs", "", b"line")
            .unwrap()
            .header(JSON_HEADER, true)
            .outgoing_properties();
        assert_eq!(raw.headers.get(JSON_HEADER), Some(&Value::Bool(true)));
        assert_eq!(raw.content_type, None);
    }

    #[tokio::test]
    async fn sends_to_queue_on_default_exchange() {
        let transport = Arc::new(FakeTransport::default());
        let sup = supervisor(transport.clone(), Arc::new(DrainCoordinator::new(Duration::from_secs(1))));
        sup.connect().await.unwrap();
        let publisher = MessagePublisher::new(sup.default_channel_manager().unwrap());

        publisher.send_to_queue("invoices", &json!({ "total": 10 })).await.unwrap();

        let published: Vec<(String, String, Vec<u8>)> = transport
            .connection()
            .channel(0)
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish {
                    exchange,
                    routing_key,
                    payload,
                    ..
                } => Some((exchange, routing_key, payload)),
                _ => None,
            })
            .collect();
        assert_eq!(
            published,
            vec![(String::new(), "invoices".to_owned(), br#"{"total":10}"#.to_vec())]
        );
    }
}
