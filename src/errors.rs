// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Router
//!
//! This module provides the error type shared by the router, the runtime binder
//! and the broker implementations. The `MqError` enum represents every failure
//! that can surface from connection, channel, binding and publishing operations.
//! Failures raised by application handlers never become an `MqError`: they are
//! isolated per message by the consumer wrapper.

use crate::router::RegistrationId;
use thiserror::Error;

/// Error returned by application handlers and producers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while binding and running message handlers.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MqError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// The shared connection was closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel was closed by the broker or by the runtime
    #[error("channel is closed")]
    ChannelClosed,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(u16),

    /// The queue does not exist on the broker
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// A channel can carry a single consumer binding
    #[error("channel already consumes from queue `{0}`")]
    ConsumerAlreadyBound(String),

    /// Error spawning the thread of a consumer
    #[error("failure to spawn consumer thread for queue `{0}`")]
    SpawnThreadError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload produced by a publisher
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The publisher is not bound on this runtime
    #[error("publisher `{0}` is not mounted")]
    PublisherNotMounted(RegistrationId),

    /// The publisher was requested with a different argument type than registered
    #[error("publisher `{0}` was registered with another argument type")]
    PublisherTypeMismatch(RegistrationId),

    /// The producer function of a publisher failed
    #[error("producer of publisher `{0}` failed: {1}")]
    ProducerError(RegistrationId, String),

    /// The runtime was shut down
    #[error("runtime is shut down")]
    RuntimeShutdown,

    /// Invalid configuration value
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
