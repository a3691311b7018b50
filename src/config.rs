// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Configuration
//!
//! Plain, deserializable configuration values consumed by the runtime. Loading
//! them (files, environment, secrets) is left to the application.

use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

/// Default delay between two connection attempts, in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
/// Default maximum number of connection attempts, `-1` meaning unbounded
pub const DEFAULT_MAXIMUM_ATTEMPTS: i64 = -1;
/// Default time the shutdown drain waits for in-flight messages, in milliseconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30000;
/// Default broker port
pub const DEFAULT_PORT: u16 = 5672;
/// Default broker host
pub const DEFAULT_HOST: &str = "localhost";

/// Top level configuration of the runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMQConfig {
    pub connection: ConnectionConfig,
    /// Time in milliseconds the drain waits for in-flight messages
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Whether exchanges and queues are asserted when they do not say otherwise
    #[serde(default = "default_assert")]
    pub assert: bool,
}

/// Connection parameters, either an explicit URI or its parts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub default_prefetch: Option<i64>,
    pub connection_name: Option<String>,
}

/// Fixed-delay retry policy of the connection supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub delay: u64,
    /// Maximum number of attempts; any negative value means unbounded
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            delay: DEFAULT_RETRY_DELAY_MS,
            maximum_attempts: DEFAULT_MAXIMUM_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    /// Pause between two connection attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }

    /// Maximum attempts, `None` when unbounded.
    pub fn maximum_attempts(&self) -> Option<u64> {
        u64::try_from(self.maximum_attempts).ok()
    }
}

impl RabbitMQConfig {
    /// Configuration with the default shutdown timeout and asserted topology.
    ///
    /// # Parameters
    /// * `connection` - How to reach the broker
    pub fn new(connection: ConnectionConfig) -> Self {
        RabbitMQConfig {
            connection,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            assert: true,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_assert() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_maximum_attempts() -> i64 {
    DEFAULT_MAXIMUM_ATTEMPTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applies_defaults() {
        let cfg: RabbitMQConfig = serde_json::from_value(json!({
            "connection": { "host": "rabbit" }
        }))
        .unwrap();

        assert_eq!(cfg.shutdown_timeout(), Duration::from_millis(30000));
        assert!(cfg.assert);
        assert_eq!(cfg.connection.retry.delay(), Duration::from_millis(5000));
        assert_eq!(cfg.connection.retry.maximum_attempts(), None);
        assert_eq!(cfg.connection.host.as_deref(), Some("rabbit"));
    }

    #[test]
    fn bounded_retry() {
        let cfg: ConnectionConfig = serde_json::from_value(json!({
            "retry": { "delay": 10, "maximum_attempts": 3 },
            "params": { "heartbeat": "30" }
        }))
        .unwrap();

        assert_eq!(cfg.retry.maximum_attempts(), Some(3));
        assert_eq!(cfg.params.get("heartbeat").map(String::as_str), Some("30"));
    }
}
