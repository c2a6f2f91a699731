// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings for the AMQP broker and the defaults a [`Runtime`]
//! applies to the registrations it mounts. Both can be loaded from the
//! environment; `from_lookup` takes any key lookup so the parsing can be
//! exercised without touching the process environment.
//!
//! [`Runtime`]: crate::runtime::Runtime

use crate::errors::MqError;
use std::str::FromStr;

/// Connection settings used by [`AmqpConnection::connect`].
///
/// [`AmqpConnection::connect`]: crate::channel::AmqpConnection::connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            app_name: "mq-router".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

impl AmqpConfig {
    /// Loads the settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `APP_NAME`: connection name reported to the broker (default: mq-router)
    /// - `RABBITMQ_HOST` (default: localhost)
    /// - `RABBITMQ_PORT` (default: 5672)
    /// - `RABBITMQ_USER` / `RABBITMQ_PASSWORD` (default: guest / guest)
    /// - `RABBITMQ_VHOST` (default: empty, the broker's default vhost)
    pub fn from_env() -> Result<Self, MqError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, MqError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        Ok(Self {
            app_name: lookup("APP_NAME").unwrap_or(default.app_name),
            host: lookup("RABBITMQ_HOST").unwrap_or(default.host),
            port: parse_or("RABBITMQ_PORT", &lookup, default.port)?,
            user: lookup("RABBITMQ_USER").unwrap_or(default.user),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(default.password),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(default.vhost),
        })
    }

    /// Builds the `amqp://` URI for these settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Defaults a runtime applies to every registration it mounts.
///
/// Router defaults and per-registration values take precedence over these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Exchange used by publishers with neither an explicit nor a router exchange.
    pub exchange: String,
    /// QoS applied to consumer channels whose router sets no prefetch.
    pub prefetch_count: u16,
    /// Whether handlers are timed and their outcome logged.
    pub tracked: bool,
    /// Whether a message whose handler failed is requeued when nacked.
    pub requeue_on_failure: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            prefetch_count: 1,
            tracked: true,
            requeue_on_failure: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads the defaults from `MQ_EXCHANGE`, `MQ_PREFETCH_COUNT`, `MQ_TRACKED`
    /// and `MQ_REQUEUE_ON_FAILURE`.
    pub fn from_env() -> Result<Self, MqError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, MqError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        Ok(Self {
            exchange: lookup("MQ_EXCHANGE").unwrap_or(default.exchange),
            prefetch_count: parse_or("MQ_PREFETCH_COUNT", &lookup, default.prefetch_count)?,
            tracked: flag_or("MQ_TRACKED", &lookup, default.tracked)?,
            requeue_on_failure: flag_or(
                "MQ_REQUEUE_ON_FAILURE",
                &lookup,
                default.requeue_on_failure,
            )?,
        })
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn tracked(mut self, tracked: bool) -> Self {
        self.tracked = tracked;
        self
    }

    pub fn requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T, MqError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| MqError::ConfigError(key.to_owned())),
        None => Ok(default),
    }
}

fn flag_or<F>(key: &str, lookup: &F, default: bool) -> Result<bool, MqError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(_) => Err(MqError::ConfigError(key.to_owned())),
        None => Ok(default),
    }
}
