// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Runtime
//!
//! Client-side runtime for RabbitMQ services: a supervised connection with
//! retries, a pool of self-healing channels, content-based routing of messages
//! to handlers, a per-message consumption pipeline and a graceful shutdown that
//! drains in-flight messages before closing.

mod otel;

#[cfg(test)]
pub(crate) mod fakes;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod drain;
pub mod driver;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod topology;
pub mod transport;
