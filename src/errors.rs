// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Runtime
//!
//! The `AmqpError` enum covers every failure the runtime can surface: connection
//! attempts and their retry budget, channel faults, topology declarations,
//! message decoding and routing, handler registration and the shutdown drain.

use thiserror::Error;

/// Represents errors that can occur while running the RabbitMQ runtime.
///
/// Connection attempt failures are retried inside the supervisor and only the
/// final `RetryLimitExceeded` leaks out. Message level errors are turned into
/// ack/reject decisions by the consumer and never stop the consume loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// A single transport-level connection attempt failed
    #[error("failure to connect: {0}")]
    ConnectionAttemptError(String),

    /// The supervisor gave up connecting (attempts exhausted or closing)
    #[error("retry limit exceeded")]
    RetryLimitExceeded,

    /// An operation required a connection that is not established
    #[error("not connected")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Prefetch was requested on a channel that was never created
    #[error("create channel before setting prefetch")]
    ChannelNotCreated,

    /// Channel-level error or close that could not be recovered
    #[error("channel fault on `{0}`: {1}")]
    ChannelFault(String, String),

    /// Error declaring or checking an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring or checking a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error issuing the consume call on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error reported by a running consumer's delivery stream
    #[error("consumer error: {0}")]
    ConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Refused to publish an empty payload
    #[error("refusing to publish an empty message")]
    EmptyMessageError,

    /// Error decoding a message payload
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error closing a channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Dispatch was called with an empty or malformed delivery
    #[error("invalid or empty message")]
    InvalidMessage,

    /// A handler registration does not provide an invocable handler
    #[error("handler `{0}` does not implement the message handler contract")]
    HandlerContractError(String),

    /// A handler registration violates the routing invariants
    #[error("invalid handler registration: {0}")]
    RegistrationError(String),

    /// A handler failed while processing a message
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// The shutdown drain did not complete in time
    #[error("rabbitmq shutdown timeout after {0}ms")]
    ShutdownTimeout(u128),
}
