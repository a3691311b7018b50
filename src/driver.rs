// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! [`Transport`] implementation on top of `lapin`. Besides forwarding the calls,
//! this is where AMQP field tables and basic properties are converted to and
//! from their JSON counterparts used across the crate.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryFields, InboundMessage, MessageProperties},
    queue::QueueDefinition,
    transport::{
        ChannelHandle, ChannelSignal, ConnectionErrorHandler, DeliveryStream, SignalHandler,
        Transport, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde_json::{Map, Number, Value};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens connections with `lapin`.
#[derive(Debug, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new(connection_name: Option<String>) -> Arc<Self> {
        Arc::new(LapinTransport { connection_name })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(uri, options).await {
            Ok(connection) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { inner: connection }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionAttemptError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(&self) -> Result<ChannelHandle, AmqpError> {
        match self.inner.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel { inner: channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn on_error(&self, handler: ConnectionErrorHandler) {
        self.inner
            .on_error(move |err: lapin::Error| handler(err.to_string()));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn basic_qos(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(&self, queue: &str) -> Result<(String, DeliveryStream), AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let tag = consumer.tag().as_str().to_owned();
        let consumer_tag = tag.clone();
        let deliveries = consumer
            .map(move |delivery| {
                delivery
                    .map(|delivery| inbound_message(&consumer_tag, delivery))
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed();

        Ok((tag, deliveries))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                basic_properties(properties),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(name = def.name(), "creating exchange");
        self.inner
            .exchange_declare(
                def.name(),
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.declare_arguments()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name().to_owned())
            })
    }

    async fn exchange_check(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to check the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!(name = def.name(), "creating queue");
        self.inner
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                AmqpError::DeclareQueueError(def.name().to_owned())
            })
    }

    async fn queue_check(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to check the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        debug!(queue, exchange, routing_key, "binding queue");
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, exchange, "error to bind queue");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    fn on_signal(&self, handler: SignalHandler) {
        self.inner
            .on_error(move |err: lapin::Error| handler(channel_signal(&err)));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

fn channel_signal(err: &lapin::Error) -> ChannelSignal {
    let not_found = matches!(
        err,
        lapin::Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    );

    ChannelSignal::Error {
        message: err.to_string(),
        not_found,
    }
}

fn inbound_message(consumer_tag: &str, delivery: Delivery) -> InboundMessage {
    let fields = DeliveryFields {
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
    };

    InboundMessage::new(fields, message_properties(&delivery.properties), delivery.data)
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|value| value.as_str().to_owned())
}

pub(crate) fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(props.content_type()),
        content_encoding: short(props.content_encoding()),
        headers: props
            .headers()
            .as_ref()
            .map(json_object)
            .unwrap_or_default(),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        expiration: short(props.expiration()),
        message_id: short(props.message_id()),
        timestamp: *props.timestamp(),
        kind: short(props.kind()),
        user_id: short(props.user_id()),
        app_id: short(props.app_id()),
        cluster_id: short(props.cluster_id()),
    }
}

pub(crate) fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if !props.headers.is_empty() {
        out = out.with_headers(field_table(&props.headers));
    }

    let text = |value: &Option<String>| value.as_ref().map(|value| ShortString::from(value.clone()));
    if let Some(value) = text(&props.content_type) {
        out = out.with_content_type(value);
    }
    if let Some(value) = text(&props.content_encoding) {
        out = out.with_content_encoding(value);
    }
    if let Some(value) = props.delivery_mode {
        out = out.with_delivery_mode(value);
    }
    if let Some(value) = props.priority {
        out = out.with_priority(value);
    }
    if let Some(value) = text(&props.correlation_id) {
        out = out.with_correlation_id(value);
    }
    if let Some(value) = text(&props.reply_to) {
        out = out.with_reply_to(value);
    }
    if let Some(value) = text(&props.expiration) {
        out = out.with_expiration(value);
    }
    if let Some(value) = text(&props.message_id) {
        out = out.with_message_id(value);
    }
    if let Some(value) = props.timestamp {
        out = out.with_timestamp(value);
    }
    if let Some(value) = text(&props.kind) {
        out = out.with_type(value);
    }
    if let Some(value) = text(&props.user_id) {
        out = out.with_user_id(value);
    }
    if let Some(value) = text(&props.app_id) {
        out = out.with_app_id(value);
    }
    if let Some(value) = text(&props.cluster_id) {
        out = out.with_cluster_id(value);
    }
    out
}

pub(crate) fn field_table(map: &Map<String, Value>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = map
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();
    FieldTable::from(table)
}

fn json_object(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), json_value(value)))
        .collect()
}

pub(crate) fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(value) => AMQPValue::Boolean(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => AMQPValue::LongLongInt(value),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(value) => AMQPValue::LongString(LongString::from(value.clone())),
        Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(values.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

pub(crate) fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(value) => Value::Bool(*value),
        AMQPValue::ShortShortInt(value) => Value::from(*value),
        AMQPValue::ShortShortUInt(value) => Value::from(*value),
        AMQPValue::ShortInt(value) => Value::from(*value),
        AMQPValue::ShortUInt(value) => Value::from(*value),
        AMQPValue::LongInt(value) => Value::from(*value),
        AMQPValue::LongUInt(value) => Value::from(*value),
        AMQPValue::LongLongInt(value) => Value::from(*value),
        AMQPValue::Float(value) => float(f64::from(*value)),
        AMQPValue::Double(value) => float(*value),
        AMQPValue::DecimalValue(decimal) => {
            float(f64::from(decimal.value) / 10f64.powi(i32::from(decimal.scale)))
        }
        AMQPValue::ShortString(value) => Value::String(value.as_str().to_owned()),
        AMQPValue::LongString(value) => {
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(values) => {
            Value::Array(values.as_slice().iter().map(json_value).collect())
        }
        AMQPValue::Timestamp(value) => Value::from(*value),
        AMQPValue::FieldTable(table) => Value::Object(json_object(table)),
        AMQPValue::ByteArray(bytes) => {
            Value::Array(bytes.as_slice().iter().map(|byte| Value::from(*byte)).collect())
        }
        AMQPValue::Void => Value::Null,
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_headers_both_ways() {
        let headers = json!({
            "json": true,
            "attempt": 3,
            "ratio": 0.5,
            "source": "billing",
            "tags": ["a", "b"],
            "nested": { "x-death": null },
        });
        let Value::Object(headers) = headers else {
            unreachable!()
        };

        assert_eq!(json_object(&field_table(&headers)), headers);
    }

    #[test]
    fn converts_narrow_amqp_values() {
        assert_eq!(json_value(&AMQPValue::ShortShortUInt(7)), json!(7));
        assert_eq!(json_value(&AMQPValue::LongUInt(70_000)), json!(70_000));
        assert_eq!(json_value(&AMQPValue::Float(f32::NAN)), Value::Null);
        assert_eq!(
            json_value(&AMQPValue::ShortString(ShortString::from("key".to_owned()))),
            json!("key")
        );
    }

    #[test]
    fn maps_basic_properties() {
        let mut props = MessageProperties {
            content_type: Some("application/json".to_owned()),
            delivery_mode: Some(2),
            message_id: Some("42".to_owned()),
            kind: Some("order.created".to_owned()),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        };
        props.headers.insert("json".to_owned(), Value::Bool(true));

        assert_eq!(message_properties(&basic_properties(&props)), props);
    }
}
