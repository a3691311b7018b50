// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining RabbitMQ queues, their bindings and
//! how they are consumed: the channel they run on, whether their payloads are
//! always JSON, and the queue-level handler used when no routed handler matches.

use crate::dispatcher::MessageHandler;
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

/// Argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Named channel a queue is consumed on, with its flow control.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSettings {
    pub key: String,
    pub prefetch: Option<u16>,
    pub global: bool,
}

impl ChannelSettings {
    /// Settings of the pooled channel `key`.
    pub fn new(key: &str) -> Self {
        ChannelSettings {
            key: key.to_owned(),
            ..Default::default()
        }
    }

    pub fn prefetch(mut self, count: u16, global: bool) -> Self {
        self.prefetch = Some(count);
        self.global = global;
        self
    }
}

/// Definition of a RabbitMQ queue.
#[derive(Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: Map<String, Value>,
    pub(crate) binds: Vec<QueueBinding>,
    pub(crate) force_json_decode: bool,
    pub(crate) channel: Option<ChannelSettings>,
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
    pub(crate) assert: Option<bool>,
    pub(crate) check: bool,
}

impl fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("exclusive", &self.exclusive)
            .field("auto_delete", &self.auto_delete)
            .field("arguments", &self.arguments)
            .field("binds", &self.binds)
            .field("force_json_decode", &self.force_json_decode)
            .field("channel", &self.channel)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable, non-exclusive and consumed on the
    /// default channel.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, Value::from(ttl))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, Value::from(max))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, Value::from(max_bytes))
    }

    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Binds the queue to an exchange with a single routing pattern.
    pub fn bind(mut self, exchange: &str, pattern: &str) -> Self {
        self.binds.push(QueueBinding::new(exchange).pattern(pattern));
        self
    }

    /// Adds a binding with any number of routing patterns.
    ///
    /// # Parameters
    /// * `binding` - Exchange and patterns to bind with
    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.binds.push(binding);
        self
    }

    /// Decodes every payload as JSON regardless of the `json` header.
    pub fn force_json_decode(mut self) -> Self {
        self.force_json_decode = true;
        self
    }

    /// Consumes the queue on a dedicated named channel.
    pub fn channel(mut self, settings: ChannelSettings) -> Self {
        self.channel = Some(settings);
        self
    }

    /// Queue-level handler used when no registered handler matches.
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Overrides the configured assert behaviour for this queue.
    pub fn assert(mut self, assert: bool) -> Self {
        self.assert = Some(assert);
        self
    }

    /// Checks the queue exists when it is not asserted.
    pub fn check(mut self) -> Self {
        self.check = true;
        self
    }
}

/// Binding of a queue to an exchange with one or more routing patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) exchange: String,
    pub(crate) patterns: Vec<String>,
}

impl QueueBinding {
    /// Creates a binding on the given exchange. Without any pattern the queue
    /// is bound with an empty routing key.
    pub fn new(exchange: &str) -> QueueBinding {
        QueueBinding {
            exchange: exchange.to_owned(),
            patterns: vec![],
        }
    }

    /// Adds a routing pattern.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_owned());
        self
    }

    /// Routing keys to bind with.
    pub(crate) fn routing_keys(&self) -> Vec<&str> {
        if self.patterns.is_empty() {
            return vec![""];
        }
        self.patterns.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_without_pattern_uses_empty_key() {
        assert_eq!(QueueBinding::new("logs").routing_keys(), vec![""]);

        let binding = QueueBinding::new("user.exchange")
            .pattern("user.created")
            .pattern("user.deleted");
        assert_eq!(binding.routing_keys(), vec!["user.created", "user.deleted"]);
    }

    #[test]
    fn builder_sets_arguments() {
        let def = QueueDefinition::new("worker")
            .durable()
            .ttl(1000)
            .max_length(10)
            .channel(ChannelSettings::new("slow").prefetch(1, false));

        assert!(def.durable);
        assert_eq!(def.arguments.get(AMQP_HEADERS_MESSAGE_TTL), Some(&Value::from(1000)));
        assert_eq!(def.arguments.get(AMQP_HEADERS_MAX_LENGTH), Some(&Value::from(10)));
        assert_eq!(def.channel.unwrap().prefetch, Some(1));
    }
}
