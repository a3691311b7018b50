// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Messages
//!
//! Transport-agnostic view of a broker delivery. The router's filters navigate
//! the JSON view of a message (`fields.*`, `properties.*`, `content.*`), so the
//! field and property names follow the AMQP camelCase spelling.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Header flagging a JSON encoded payload
pub const JSON_HEADER: &str = "json";

/// Delivery metadata attached by the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFields {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Basic properties of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl MessageProperties {
    /// Whether the `json` header is explicitly set to true.
    pub fn is_json(&self) -> bool {
        matches!(self.headers.get(JSON_HEADER), Some(Value::Bool(true)))
    }
}

/// One broker delivery, optionally with its decoded content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub fields: DeliveryFields,
    pub properties: MessageProperties,
    pub content: Vec<u8>,
    pub decoded: Option<Value>,
}

impl InboundMessage {
    pub fn new(fields: DeliveryFields, properties: MessageProperties, content: Vec<u8>) -> Self {
        InboundMessage {
            fields,
            properties,
            content,
            decoded: None,
        }
    }

    /// Brokers number deliveries from 1, a zero tag never came from a channel.
    pub fn is_well_formed(&self) -> bool {
        self.fields.delivery_tag > 0
    }

    /// Decodes the content as JSON when forced or flagged by the `json` header,
    /// otherwise leaves the raw bytes untouched.
    pub fn decode(mut self, force_json: bool) -> Result<Self, AmqpError> {
        if force_json || self.properties.is_json() {
            let value = serde_json::from_slice::<Value>(&self.content)
                .map_err(|err| AmqpError::DecodeError(err.to_string()))?;
            self.decoded = Some(value);
        }

        Ok(self)
    }

    /// Deserializes the decoded content, or the raw bytes when not decoded.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        match &self.decoded {
            Some(value) => T::deserialize(value),
            None => serde_json::from_slice(&self.content),
        }
        .map_err(|err| AmqpError::DecodeError(err.to_string()))
    }

    /// JSON view of the whole message used by field-path filters.
    pub fn as_value(&self) -> Value {
        let content = match &self.decoded {
            Some(value) => value.clone(),
            None => Value::String(String::from_utf8_lossy(&self.content).into_owned()),
        };

        json!({
            "fields": serde_json::to_value(&self.fields).unwrap_or_default(),
            "properties": serde_json::to_value(&self.properties).unwrap_or_default(),
            "content": content,
        })
    }
}

/// Looks up a dotted path (`content.user.id`, `properties.headers.kind`).
/// Numeric segments index into arrays.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Outcome of handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Acknowledge the message
    Ack,
    /// Reject the message, optionally returning it to the queue
    Reject { requeue: bool },
    /// No explicit decision, acknowledged as a fallback
    Ignore,
    /// Leave the message unacknowledged, the handler settles it later
    Defer,
}
