// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The router never speaks the broker protocol itself. It relies on a
//! connection able to open channels, and on channels able to apply QoS, bind a
//! consumer callback to a queue, publish, and run a blocking receive loop.
//! [`AmqpConnection`](crate::channel::AmqpConnection) implements these traits
//! over lapin and [`MemoryBroker`](crate::memory::MemoryBroker) implements them
//! in process.
//!
//! A connection is shared by every channel of a runtime and is not assumed to
//! be safe for concurrent use: the runtime serializes `open_channel` and
//! `close`. A channel is used by one thread at a time.

use crate::errors::MqError;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// Message headers, also used to carry the trace context.
pub type Headers = BTreeMap<String, String>;

/// Callback invoked by a channel for every delivery of its consumer binding.
///
/// The returned [`Acknowledgement`] is applied by the channel.
pub type DeliveryCallback = Box<dyn FnMut(&Delivery) -> Acknowledgement + Send>;

/// A message delivered by the broker to a consumer binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A message handed to a channel for publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub content_type: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// What the channel must do with a delivery once its callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

/// A connection to the broker, shared by all channels of a runtime.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel on this connection.
    fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MqError>;

    /// Closes the connection, which closes every channel opened on it.
    fn close(&self) -> Result<(), MqError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[cfg_attr(test, mockall::automock)]
pub trait BrokerChannel: Send {
    /// Limits the number of unacknowledged deliveries held by the channel.
    fn set_qos(&mut self, prefetch_count: u16) -> Result<(), MqError>;

    /// Binds `callback` to `queue`. Deliveries only flow once
    /// [`run_until_closed`](BrokerChannel::run_until_closed) is running.
    fn consume(&mut self, queue: &str, callback: DeliveryCallback) -> Result<(), MqError>;

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), MqError>;

    /// Blocks the calling thread dispatching deliveries to the consumer
    /// callback until `stop` fires, the channel closes or the connection closes.
    fn run_until_closed(&mut self, stop: &StopSignal) -> Result<(), MqError>;
}

/// Cancellation token telling a receive loop to return.
///
/// Clones share the same state; stopping one stops them all.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`stop`](StopSignal::stop) was called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
