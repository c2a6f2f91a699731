// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channels
//!
//! This module implements the broker traits over lapin. The connection owns a
//! tokio runtime that drives lapin's futures; channels block on it from the
//! calling thread, so the consumer threads of a runtime each run their
//! receive loop on their own OS thread.
//!
//! These types must not be used from within an async context: every operation
//! blocks the calling thread until the broker answers.

use crate::{
    broker::{
        Acknowledgement, BrokerChannel, BrokerConnection, Delivery, DeliveryCallback, Headers,
        OutboundMessage, StopSignal,
    },
    config::AmqpConfig,
    errors::MqError,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

/// A lapin connection to RabbitMQ.
pub struct AmqpConnection {
    runtime: Arc<Runtime>,
    connection: Connection,
}

impl AmqpConnection {
    /// Connects to RabbitMQ with the settings of `cfg`.
    ///
    /// Starts the single-worker tokio runtime that drives the connection and
    /// all of its channels.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and connection name
    ///
    /// # Returns
    /// The connected instance, or `ConnectionError` when the broker is unreachable
    ///
    /// # Example
    /// ```ignore
    /// let connection = AmqpConnection::connect(&AmqpConfig::from_env()?)?;
    /// ```
    pub fn connect(cfg: &AmqpConfig) -> Result<Self, MqError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mq-router-io")
            .enable_all()
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to start the io runtime");
                MqError::ConnectionError
            })?;

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));

        let connection = match runtime.block_on(Connection::connect(&cfg.uri(), options)) {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(MqError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Self {
            runtime: Arc::new(runtime),
            connection,
        })
    }
}

impl BrokerConnection for AmqpConnection {
    /// Creates a lapin channel sharing the connection's runtime.
    fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, MqError> {
        match self.runtime.block_on(self.connection.create_channel()) {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Box::new(AmqpChannel {
                    runtime: self.runtime.clone(),
                    channel,
                    consumer: None,
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(MqError::ChannelError)
            }
        }
    }

    /// Closes the connection with reply code 200; every channel stops with it.
    fn close(&self) -> Result<(), MqError> {
        self.runtime
            .block_on(self.connection.close(200, "shutdown"))
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                MqError::ConnectionError
            })
    }
}

struct AmqpConsumer {
    queue: String,
    stream: Consumer,
    callback: DeliveryCallback,
}

/// A lapin channel.
pub struct AmqpChannel {
    runtime: Arc<Runtime>,
    channel: Channel,
    consumer: Option<AmqpConsumer>,
}

impl BrokerChannel for AmqpChannel {
    fn set_qos(&mut self, prefetch_count: u16) -> Result<(), MqError> {
        self.runtime
            .block_on(
                self.channel
                    .basic_qos(prefetch_count, BasicQosOptions { global: false }),
            )
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                MqError::QoSDeclarationError(prefetch_count)
            })
    }

    fn consume(&mut self, queue: &str, callback: DeliveryCallback) -> Result<(), MqError> {
        if let Some(consumer) = &self.consumer {
            return Err(MqError::ConsumerAlreadyBound(consumer.queue.clone()));
        }

        let stream = match self.runtime.block_on(self.channel.basic_consume(
            queue,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )) {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(MqError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        self.consumer = Some(AmqpConsumer {
            queue: queue.to_owned(),
            stream,
            callback,
        });
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), MqError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.clone()))
            .with_message_id(ShortString::from(message.message_id.clone()))
            .with_headers(field_table(&message.headers));

        match self.runtime.block_on(self.channel.basic_publish(
            &message.exchange,
            &message.routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &message.body,
            properties,
        )) {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(MqError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    fn run_until_closed(&mut self, stop: &StopSignal) -> Result<(), MqError> {
        let Some(AmqpConsumer {
            queue,
            stream,
            callback,
        }) = self.consumer.as_mut()
        else {
            self.runtime.block_on(stop.stopped());
            return Ok(());
        };

        loop {
            let delivery = match next_or_stop(&self.runtime, stop, stream) {
                Next::Item(Ok(delivery)) => delivery,
                Next::Item(Err(err)) => {
                    error!(queue = queue.as_str(), error = err.to_string(), "errors consume msg");
                    return Err(MqError::ConsumerError(queue.clone()));
                }
                Next::Stopped => return Ok(()),
                Next::Ended => return Err(MqError::ChannelClosed),
            };

            // outside the runtime: handlers may publish through it
            let acknowledgement = callback(&to_delivery(&delivery));

            let result = match acknowledgement {
                Acknowledgement::Ack => self
                    .runtime
                    .block_on(delivery.ack(BasicAckOptions { multiple: false }))
                    .map_err(|err| (err, MqError::AckMessageError)),
                Acknowledgement::Nack { requeue } => self
                    .runtime
                    .block_on(delivery.nack(BasicNackOptions {
                        multiple: false,
                        requeue,
                    }))
                    .map_err(|err| (err, MqError::NackMessageError)),
            };

            if let Err((err, kind)) = result {
                warn!(queue = queue.as_str(), error = err.to_string(), "{}", kind);
            }
        }
    }
}

enum Next<T> {
    Item(T),
    Stopped,
    Ended,
}

/// Waits on `runtime` for the next item of `stream`, or for `stop`.
fn next_or_stop<S>(runtime: &Runtime, stop: &StopSignal, stream: &mut S) -> Next<S::Item>
where
    S: Stream + Unpin,
{
    runtime.block_on(async {
        tokio::select! {
            _ = stop.stopped() => Next::Stopped,
            next = stream.next() => match next {
                Some(item) => Next::Item(item),
                None => Next::Ended,
            },
        }
    })
}

fn to_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    let mut headers = Headers::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => continue,
            };
            headers.insert(key.as_str().to_owned(), value);
        }
    }

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        headers,
        body: delivery.data.clone(),
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    FieldTable::from(btree)
}
