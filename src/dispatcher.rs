// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch Router
//!
//! Routes an inbound message to the best matching handler registered for a
//! queue. Every registration is scored against the message:
//!
//! - the AMQP fields must match (default exchange straight to the queue, or the
//!   registration's exchange with its routing key), otherwise the registration
//!   is dropped without looking at its filters;
//! - every field filter must match, a matching non-empty filter set adds one;
//! - the fallback flag adds one.
//!
//! The highest score wins, the first registered handler wins ties.

use crate::{
    errors::AmqpError,
    message::{lookup, DispatchResult, InboundMessage},
    transport::ChannelHandle,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::{fmt, sync::Arc};
use tracing::debug;

/// Handles messages delivered on a queue.
///
/// Returning an error sends the message down the consumer's error path, which
/// rejects it (or requeues it while the runtime is shutting down).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(
        &self,
        message: &InboundMessage,
        channel: &ChannelHandle,
    ) -> Result<DispatchResult, AmqpError>;
}

/// Value matcher used for routing keys and field filters.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(Value),
    Pattern(Regex),
}

impl Matcher {
    /// Matches values equal to `value`.
    pub fn exact(value: impl Into<Value>) -> Self {
        Matcher::Exact(value.into())
    }

    /// Matches string values against a regular expression.
    ///
    /// # Parameters
    /// * `pattern` - The regular expression
    ///
    /// # Returns
    /// The matcher, or a `RegistrationError` for an invalid expression
    pub fn pattern(pattern: &str) -> Result<Self, AmqpError> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|err| AmqpError::RegistrationError(err.to_string()))
    }

    /// Patterns only apply to strings, exact values compare structurally.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (Matcher::Exact(expected), Some(value)) => expected == value,
            (Matcher::Exact(_), None) => false,
            (Matcher::Pattern(regex), Some(Value::String(value))) => regex.is_match(value),
            (Matcher::Pattern(_), _) => false,
        }
    }
}

impl From<&str> for Matcher {
    fn from(value: &str) -> Self {
        Matcher::Exact(Value::String(value.to_owned()))
    }
}

/// One routing entry of the router.
#[derive(Clone, Default)]
pub struct HandlerRegistration {
    pub(crate) name: String,
    pub(crate) queue: String,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: Option<Matcher>,
    pub(crate) filter: Vec<(String, Matcher)>,
    pub(crate) fallback: bool,
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("filter", &self.filter)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl HandlerRegistration {
    /// Creates a registration for a handler consuming the given queue.
    pub fn new(name: &str, queue: &str) -> Self {
        HandlerRegistration {
            name: name.to_owned(),
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Restricts the handler to messages published on an exchange.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the message must come from
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the routing key matcher. An empty exact key is the same as none.
    pub fn routing_key(mut self, matcher: impl Into<Matcher>) -> Self {
        self.routing_key = match matcher.into() {
            Matcher::Exact(Value::String(key)) if key.is_empty() => None,
            matcher => Some(matcher),
        };
        self
    }

    /// Adds a filter on a dotted path of the message (`content.action`).
    pub fn filter(mut self, path: &str, matcher: impl Into<Matcher>) -> Self {
        self.filter.push((path.to_owned(), matcher.into()));
        self
    }

    /// Selects the handler when nothing more specific matches.
    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Handler invoked for the matching messages.
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validates the registration can ever be selected and invoked.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.is_empty() {
            return Err(AmqpError::RegistrationError(format!(
                "handler `{}` has no queue",
                self.name
            )));
        }

        if self.exchange.is_none()
            && self.routing_key.is_none()
            && self.filter.is_empty()
            && !self.fallback
        {
            return Err(AmqpError::RegistrationError(format!(
                "handler `{}` needs an exchange, a routing key, a filter or the fallback flag, \
                 use the queue handler instead",
                self.name
            )));
        }

        if self.handler.is_none() {
            return Err(AmqpError::HandlerContractError(self.name.clone()));
        }

        Ok(())
    }

    /// Scores this registration against a message, 0 meaning no match.
    /// `view` is the JSON view of `message` used by filters.
    pub fn score(&self, message: &InboundMessage, view: &Value) -> u32 {
        if !self.matches_amqp_fields(message) {
            return 0;
        }

        let mut score = 1;

        if !self.filter.is_empty() {
            let matched = self
                .filter
                .iter()
                .all(|(path, matcher)| matcher.matches(lookup(view, path)));
            if !matched {
                return 0;
            }
            score += 1;
        }

        if self.fallback {
            score += 1;
        }

        score
    }

    fn matches_amqp_fields(&self, message: &InboundMessage) -> bool {
        let fields = &message.fields;

        if fields.exchange.is_empty() && fields.routing_key == self.queue {
            return true;
        }

        match (&self.exchange, &self.routing_key) {
            (Some(exchange), Some(routing_key)) => {
                *exchange == fields.exchange
                    && routing_key.matches(Some(&Value::String(fields.routing_key.clone())))
            }
            (Some(exchange), None) => *exchange == fields.exchange,
            _ => false,
        }
    }
}

/// Deferred invocation of the handler selected for a message.
pub struct Dispatch {
    name: String,
    handler: Arc<dyn MessageHandler>,
}

impl Dispatch {
    pub fn handler_name(&self) -> &str {
        &self.name
    }

    /// Runs the selected handler.
    pub async fn invoke(
        &self,
        message: &InboundMessage,
        channel: &ChannelHandle,
    ) -> Result<DispatchResult, AmqpError> {
        self.handler.on_message(message, channel).await
    }
}

/// Registry of handlers for one queue.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    registrations: Vec<HandlerRegistration>,
}

impl MessageRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        MessageRouter::default()
    }

    /// Adds a handler to the registry once it passes validation.
    pub fn register(&mut self, registration: HandlerRegistration) -> Result<(), AmqpError> {
        registration.validate()?;
        debug!(
            handler = registration.name.as_str(),
            queue = registration.queue.as_str(),
            "handler registered"
        );
        self.registrations.push(registration);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Returns the best scoring registration for the message, if any.
    pub fn find_handler(&self, message: &InboundMessage) -> Option<&HandlerRegistration> {
        let view = message.as_value();

        let mut scored: Vec<(u32, &HandlerRegistration)> = self
            .registrations
            .iter()
            .map(|registration| (registration.score(message, &view), registration))
            .filter(|(score, _)| *score > 0)
            .collect();

        // stable: the first registered entry wins ties
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        scored.into_iter().next().map(|(_, registration)| registration)
    }

    /// Resolves the handler invocation for a message.
    ///
    /// `Ok(None)` means no handler matched and the caller applies its own
    /// default (queue handler or ack).
    pub fn dispatch(&self, message: &InboundMessage) -> Result<Option<Dispatch>, AmqpError> {
        if !message.is_well_formed() {
            return Err(AmqpError::InvalidMessage);
        }

        let Some(registration) = self.find_handler(message) else {
            return Ok(None);
        };

        let Some(handler) = registration.handler.clone() else {
            return Err(AmqpError::HandlerContractError(registration.name.clone()));
        };

        Ok(Some(Dispatch {
            name: registration.name.clone(),
            handler,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryFields, MessageProperties};
    use serde_json::json;

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(MockMessageHandler::new())
    }

    fn message(exchange: &str, routing_key: &str, content: Value) -> InboundMessage {
        InboundMessage {
            fields: DeliveryFields {
                consumer_tag: "ctag".to_owned(),
                delivery_tag: 1,
                redelivered: false,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            },
            properties: MessageProperties::default(),
            content: content.to_string().into_bytes(),
            decoded: Some(content),
        }
    }

    fn score(registration: &HandlerRegistration, message: &InboundMessage) -> u32 {
        registration.score(message, &message.as_value())
    }

    #[test]
    fn rejects_registration_without_discriminator() {
        let mut router = MessageRouter::new();
        let err = router
            .register(HandlerRegistration::new("bare", "worker").handler(handler()))
            .unwrap_err();

        assert!(matches!(err, AmqpError::RegistrationError(_)));
        assert!(router.is_empty());
    }

    #[test]
    fn rejects_registration_without_handler() {
        let mut router = MessageRouter::new();
        let err = router
            .register(HandlerRegistration::new("headless", "worker").exchange("user.exchange"))
            .unwrap_err();

        assert_eq!(err, AmqpError::HandlerContractError("headless".to_owned()));
    }

    #[test]
    fn empty_routing_key_counts_as_absent() {
        let registration = HandlerRegistration::new("h", "worker").routing_key("");
        assert!(registration.routing_key.is_none());
        assert!(registration.handler(handler()).validate().is_err());
    }

    #[test]
    fn exact_queue_match_scores_one() {
        let registration = HandlerRegistration::new("worker", "worker");
        let msg = message("", "worker", json!({}));

        assert_eq!(score(&registration, &msg), 1);
    }

    #[test]
    fn exchange_routing_key_and_filter_scores_two() {
        let registration = HandlerRegistration::new("special", "users")
            .exchange("user.exchange")
            .routing_key("user.created")
            .filter("content.action", "special");

        let special = message("user.exchange", "user.created", json!({ "action": "special" }));
        let other = message("user.exchange", "user.created", json!({ "action": "other" }));

        assert_eq!(score(&registration, &special), 2);
        assert_eq!(score(&registration, &other), 0);
    }

    #[test]
    fn routing_key_pattern() {
        let registration = HandlerRegistration::new("users", "users")
            .exchange("user.exchange")
            .routing_key(Matcher::pattern(r"^user\.(created|updated)$").unwrap());

        assert_eq!(score(&registration, &message("user.exchange", "user.updated", json!({}))), 1);
        assert_eq!(score(&registration, &message("user.exchange", "user.deleted", json!({}))), 0);
        assert_eq!(score(&registration, &message("other", "user.updated", json!({}))), 0);
    }

    #[test]
    fn exchange_without_routing_key_matches_any_key() {
        let registration = HandlerRegistration::new("all", "users").exchange("user.exchange");

        assert_eq!(score(&registration, &message("user.exchange", "", json!({}))), 1);
        assert_eq!(score(&registration, &message("user.exchange", "user.created", json!({}))), 1);
        assert_eq!(score(&registration, &message("order.exchange", "", json!({}))), 0);
    }

    #[test]
    fn filters_and_fallback_never_rescue_a_failed_base_match() {
        let registration = HandlerRegistration::new("h", "users")
            .exchange("user.exchange")
            .routing_key("user.created")
            .filter("content.action", "special")
            .fallback();

        let msg = message("other.exchange", "user.created", json!({ "action": "special" }));
        assert_eq!(score(&registration, &msg), 0);

        let mut router = MessageRouter::new();
        router.register(registration.handler(handler())).unwrap();
        assert!(router.find_handler(&msg).is_none());
    }

    #[test]
    fn fallback_adds_one() {
        let registration = HandlerRegistration::new("h", "users")
            .exchange("user.exchange")
            .fallback();

        assert_eq!(score(&registration, &message("user.exchange", "x", json!({}))), 2);
    }

    #[test]
    fn filter_on_pattern_and_non_string_values() {
        let registration = HandlerRegistration::new("h", "users")
            .exchange("user.exchange")
            .filter("content.count", Matcher::exact(3))
            .filter("content.name", Matcher::pattern("^jo").unwrap());

        let matching = message("user.exchange", "", json!({ "count": 3, "name": "john" }));
        let wrong_type = message("user.exchange", "", json!({ "count": "3", "name": "john" }));
        let missing = message("user.exchange", "", json!({ "count": 3 }));

        assert_eq!(score(&registration, &matching), 2);
        assert_eq!(score(&registration, &wrong_type), 0);
        assert_eq!(score(&registration, &missing), 0);
    }

    #[test]
    fn highest_score_wins() {
        let mut router = MessageRouter::new();
        router
            .register(
                HandlerRegistration::new("generic", "users")
                    .exchange("user.exchange")
                    .routing_key("user.created")
                    .handler(handler()),
            )
            .unwrap();
        router
            .register(
                HandlerRegistration::new("specific", "users")
                    .exchange("user.exchange")
                    .routing_key("user.created")
                    .filter("content.action", "special")
                    .handler(handler()),
            )
            .unwrap();

        let special = message("user.exchange", "user.created", json!({ "action": "special" }));
        let plain = message("user.exchange", "user.created", json!({ "action": "other" }));

        assert_eq!(router.find_handler(&special).unwrap().name(), "specific");
        assert_eq!(router.find_handler(&plain).unwrap().name(), "generic");
    }

    #[test]
    fn first_registered_wins_ties() {
        let mut router = MessageRouter::new();
        for name in ["first", "second"] {
            router
                .register(
                    HandlerRegistration::new(name, "users")
                        .exchange("user.exchange")
                        .routing_key("user.created")
                        .handler(handler()),
                )
                .unwrap();
        }

        let msg = message("user.exchange", "user.created", json!({}));
        assert_eq!(router.find_handler(&msg).unwrap().name(), "first");
    }

    #[tokio::test]
    async fn same_handler_registered_twice_is_invoked_once() {
        let mut mock = MockMessageHandler::new();
        mock.expect_on_message()
            .times(1)
            .returning(|_, _| Ok(DispatchResult::Ack));
        let shared: Arc<dyn MessageHandler> = Arc::new(mock);

        let mut router = MessageRouter::new();
        for _ in 0..2 {
            router
                .register(
                    HandlerRegistration::new("dup", "users")
                        .exchange("user.exchange")
                        .handler(shared.clone()),
                )
                .unwrap();
        }

        let msg = message("user.exchange", "user.created", json!({}));
        let dispatch = router.dispatch(&msg).unwrap().unwrap();
        let channel: ChannelHandle = Arc::new(crate::fakes::FakeChannel::default());

        assert_eq!(dispatch.invoke(&msg, &channel).await, Ok(DispatchResult::Ack));
    }

    #[test]
    fn dispatch_rejects_malformed_message() {
        let router = MessageRouter::new();
        let err = router.dispatch(&InboundMessage::default()).err();

        assert_eq!(err, Some(AmqpError::InvalidMessage));
    }

    #[test]
    fn dispatch_without_match_defers_to_caller() {
        let mut router = MessageRouter::new();
        router
            .register(
                HandlerRegistration::new("h", "users")
                    .exchange("user.exchange")
                    .handler(handler()),
            )
            .unwrap();

        let msg = message("order.exchange", "order.created", json!({}));
        assert!(router.dispatch(&msg).unwrap().is_none());
    }
}
