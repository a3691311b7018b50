// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Declarative description of the exchanges a service relies on. Each one is
//! either asserted (declared) or checked (passively declared) during bootstrap,
//! before any queue gets bound.

use serde_json::{Map, Value};

/// Argument carrying the alternate exchange of an exchange
pub const AMQP_ARGUMENT_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange.
///
/// `assert` left unset defers to the runtime configuration; a definition that
/// is not asserted may still be checked for existence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) alternate_exchange: Option<String>,
    pub(crate) arguments: Map<String, Value>,
    pub(crate) assert: Option<bool>,
    pub(crate) check: bool,
}

impl ExchangeDefinition {
    /// Creates a direct exchange definition with default settings.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The routing behaviour of the exchange
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Routes on routing key patterns.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Routes unroutable messages to the given exchange.
    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Adds a declaration argument.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Overrides the configured assert behaviour for this exchange.
    pub fn assert(mut self, assert: bool) -> Self {
        self.assert = Some(assert);
        self
    }

    /// Checks the exchange exists when it is not asserted.
    pub fn check(mut self) -> Self {
        self.check = true;
        self
    }

    /// Declaration arguments, alternate exchange included.
    pub(crate) fn declare_arguments(&self) -> Map<String, Value> {
        let mut args = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            args.insert(
                AMQP_ARGUMENT_ALTERNATE_EXCHANGE.to_owned(),
                Value::String(alternate.clone()),
            );
        }
        args
    }
}
