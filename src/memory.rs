// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process implementation of the broker traits. Queues must be declared
//! before a consumer binds to them. Publishing to the default exchange (`""`)
//! routes to the queue named by the routing key; other exchanges route through
//! the bindings declared with [`MemoryBroker::bind_queue`]. Every consumer bound
//! to a queue receives its own copy of each message.
//!
//! The broker records what it was asked to do (QoS per channel, published
//! messages, acknowledgements) so the wiring of an application can be checked
//! without a RabbitMQ server. These records are kept until
//! [`MemoryBroker::clear`] is called.

use crate::{
    broker::{
        Acknowledgement, BrokerChannel, BrokerConnection, Delivery, DeliveryCallback, Headers,
        OutboundMessage, StopSignal,
    },
    errors::MqError,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the broker knows about one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: usize,
    pub prefetch_count: Option<u16>,
    pub queue: Option<String>,
    pub open: bool,
}

/// An acknowledgement applied by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub queue: String,
    pub channel: usize,
    pub delivery_tag: u64,
    pub acknowledgement: Acknowledgement,
}

#[derive(Default)]
struct QueueState {
    subscribers: Vec<(usize, Sender<Delivery>)>,
    pending: VecDeque<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    queues: BTreeMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    channels: Vec<ChannelSnapshot>,
    published: Vec<OutboundMessage>,
    acknowledgements: Vec<AckRecord>,
    next_tag: u64,
    next_channel: usize,
    fail_open_channel: bool,
    fail_publish: bool,
}

impl BrokerState {
    fn enqueue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        headers: &Headers,
        body: &[u8],
    ) {
        self.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: self.next_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            headers: headers.clone(),
            body: body.to_vec(),
        };

        let Some(state) = self.queues.get_mut(queue) else {
            debug!(queue, "dropping message routed to an unknown queue");
            return;
        };

        state
            .subscribers
            .retain(|(_, tx)| tx.send(delivery.clone()).is_ok());
        if state.subscribers.is_empty() {
            state.pending.push_back(delivery);
        }
    }

    fn channel_mut(&mut self, id: usize) -> Option<&mut ChannelSnapshot> {
        self.channels.iter_mut().find(|channel| channel.id == id)
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn declare_queue(&self, queue: &str) {
        self.state.lock().queues.entry(queue.to_owned()).or_default();
    }

    /// Routes messages published on `exchange` with `routing_key` to `queue`.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.state.lock().bindings.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
    }

    /// Delivers `body` to every consumer of `queue`, or keeps it until one binds.
    ///
    /// # Parameters
    /// * `queue` - A queue declared with [`declare_queue`](MemoryBroker::declare_queue)
    /// * `body` - The raw message payload
    ///
    /// # Returns
    /// Ok(()) once queued, or `QueueNotFound` when the queue was never declared
    pub fn deliver(&self, queue: &str, body: impl AsRef<[u8]>) -> Result<(), MqError> {
        self.deliver_with_headers(queue, &Headers::new(), body)
    }

    /// Same as [`deliver`](MemoryBroker::deliver), with message headers such as
    /// an upstream `traceparent`.
    pub fn deliver_with_headers(
        &self,
        queue: &str,
        headers: &Headers,
        body: impl AsRef<[u8]>,
    ) -> Result<(), MqError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(MqError::QueueNotFound(queue.to_owned()));
        }

        state.enqueue(queue, "", queue, headers, body.as_ref());
        Ok(())
    }

    /// Drops the published-message and acknowledgement logs, and the
    /// snapshots of closed channels.
    ///
    /// The logs grow with every publish and delivery; long-running users call
    /// this after inspecting them.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.published.clear();
        state.acknowledgements.clear();
        state.channels.retain(|channel| channel.open);
    }

    /// Messages published on any channel, in publishing order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    pub fn channels(&self) -> Vec<ChannelSnapshot> {
        self.state.lock().channels.clone()
    }

    /// Channels currently consuming from `queue`.
    pub fn consumers(&self, queue: &str) -> Vec<ChannelSnapshot> {
        self.state
            .lock()
            .channels
            .iter()
            .filter(|channel| channel.open && channel.queue.as_deref() == Some(queue))
            .cloned()
            .collect()
    }

    /// Acknowledgements applied to deliveries of `queue`.
    pub fn acknowledgements(&self, queue: &str) -> Vec<AckRecord> {
        self.state
            .lock()
            .acknowledgements
            .iter()
            .filter(|record| record.queue == queue)
            .cloned()
            .collect()
    }

    /// Makes every following `open_channel` fail.
    pub fn fail_open_channel(&self, fail: bool) {
        self.state.lock().fail_open_channel = fail;
    }

    /// Makes every following `publish` fail.
    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection for MemoryConnection {
    fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::ConnectionClosed);
        }

        let mut state = self.broker.state.lock();
        if state.fail_open_channel {
            return Err(MqError::ChannelError);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.push(ChannelSnapshot {
            id,
            prefetch_count: None,
            queue: None,
            open: true,
        });

        Ok(Box::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            connection_closed: self.closed.clone(),
            consumer: None,
        }))
    }

    fn close(&self) -> Result<(), MqError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct BoundConsumer {
    queue: String,
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
    callback: DeliveryCallback,
}

/// A channel of a [`MemoryConnection`].
pub struct MemoryChannel {
    id: usize,
    broker: MemoryBroker,
    connection_closed: Arc<AtomicBool>,
    consumer: Option<BoundConsumer>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), MqError> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(MqError::ChannelClosed);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.broker.state.lock();
        if let Some(consumer) = &self.consumer {
            if let Some(queue) = state.queues.get_mut(&consumer.queue) {
                queue.subscribers.retain(|(id, _)| *id != self.id);
            }
        }
        if let Some(channel) = state.channel_mut(self.id) {
            channel.open = false;
        }
    }
}

impl BrokerChannel for MemoryChannel {
    fn set_qos(&mut self, prefetch_count: u16) -> Result<(), MqError> {
        self.ensure_open()?;
        if let Some(channel) = self.broker.state.lock().channel_mut(self.id) {
            channel.prefetch_count = Some(prefetch_count);
        }
        Ok(())
    }

    fn consume(&mut self, queue: &str, callback: DeliveryCallback) -> Result<(), MqError> {
        self.ensure_open()?;
        if let Some(consumer) = &self.consumer {
            return Err(MqError::ConsumerAlreadyBound(consumer.queue.clone()));
        }

        let (tx, rx) = mpsc::channel();
        let mut state = self.broker.state.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(MqError::QueueNotFound(queue.to_owned()));
        };

        for delivery in queue_state.pending.drain(..) {
            let _ = tx.send(delivery);
        }
        queue_state.subscribers.push((self.id, tx.clone()));

        if let Some(channel) = state.channel_mut(self.id) {
            channel.queue = Some(queue.to_owned());
        }

        self.consumer = Some(BoundConsumer {
            queue: queue.to_owned(),
            tx,
            rx,
            callback,
        });
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), MqError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if state.fail_publish {
            return Err(MqError::PublishingError);
        }

        state.published.push(message.clone());

        let targets: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            state
                .bindings
                .iter()
                .filter(|(ex, key, _)| *ex == message.exchange && *key == message.routing_key)
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        for queue in targets {
            state.enqueue(
                &queue,
                &message.exchange,
                &message.routing_key,
                &message.headers,
                &message.body,
            );
        }
        Ok(())
    }

    fn run_until_closed(&mut self, stop: &StopSignal) -> Result<(), MqError> {
        let result = loop {
            if stop.is_stopped() {
                break Ok(());
            }
            if self.connection_closed.load(Ordering::SeqCst) {
                break Err(MqError::ConnectionClosed);
            }

            let Some(consumer) = self.consumer.as_mut() else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };

            match consumer.rx.recv_timeout(POLL_INTERVAL) {
                Ok(delivery) => {
                    let acknowledgement = (consumer.callback)(&delivery);
                    self.broker.state.lock().acknowledgements.push(AckRecord {
                        queue: consumer.queue.clone(),
                        channel: self.id,
                        delivery_tag: delivery.delivery_tag,
                        acknowledgement,
                    });

                    if acknowledgement == (Acknowledgement::Nack { requeue: true }) {
                        let _ = consumer.tx.send(Delivery {
                            redelivered: true,
                            ..delivery
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break Err(MqError::ChannelClosed),
            }
        };

        self.close();
        result
    }
}
