// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Wrapper
//!
//! A publisher registration wraps an application function whose return value
//! is the message payload. Once mounted, the runtime hands out a [`Publisher`]:
//! calling it runs the function, serializes the result as JSON and publishes
//! it on the registration's channel, to the resolved exchange and routing key.
//! The trace context of the caller is propagated in the message headers.
//!
//! A [`Publisher`] can be cloned and called from any thread. Calls sharing the
//! same registration are serialized on its channel.

use crate::{
    broker::{BrokerChannel, Headers, OutboundMessage},
    errors::{HandlerError, MqError},
    otel,
    router::RegistrationId,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    any::Any,
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, error, info, Dispatch};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Why a producer function did not yield a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProduceFailure {
    Producer(String),
    Serialize(String),
}

/// Producer function of a registration, with the serialization step applied.
pub(crate) type Producer<A> = Arc<dyn Fn(A) -> Result<Vec<u8>, ProduceFailure> + Send + Sync>;

/// A [`Producer`] with its argument type erased; downcast back when a typed
/// [`Publisher`] is requested.
pub(crate) type AnyProducer = Arc<dyn Any + Send + Sync>;

pub(crate) fn json_producer<A, T, F>(producer: F) -> AnyProducer
where
    A: 'static,
    T: Serialize,
    F: Fn(A) -> Result<T, HandlerError> + Send + Sync + 'static,
{
    let producer: Producer<A> = Arc::new(move |args| {
        let payload = producer(args).map_err(|err| ProduceFailure::Producer(err.to_string()))?;
        serde_json::to_vec(&payload).map_err(|err| ProduceFailure::Serialize(err.to_string()))
    });

    Arc::new(producer)
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub size: usize,
}

/// Publishing side of a mounted registration: its resolved target and its channel.
pub(crate) struct PublisherBinding {
    registration: RegistrationId,
    exchange: String,
    routing_key: String,
    tracked: bool,
    channel: Mutex<Box<dyn BrokerChannel>>,
    logger: Option<Dispatch>,
    tracer: BoxedTracer,
    closed: AtomicBool,
}

impl PublisherBinding {
    pub(crate) fn new(
        registration: RegistrationId,
        exchange: &str,
        routing_key: &str,
        tracked: bool,
        channel: Box<dyn BrokerChannel>,
        logger: Option<Dispatch>,
    ) -> Self {
        Self {
            registration,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            tracked,
            channel: Mutex::new(channel),
            logger,
            tracer: global::tracer(otel::PUBLISHER_TRACER),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn exchange(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Rejects further publishes; the runtime calls it when unbinding.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn send(&self, body: Vec<u8>, started: Instant) -> Result<PublishReceipt, MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::RuntimeShutdown);
        }

        let mut headers = Headers::new();
        let ctx = otel::inject_producer_span(&mut headers, &self.tracer, &self.routing_key);

        let message = OutboundMessage {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            message_id: Uuid::new_v4().to_string(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers,
            body,
        };

        let result = self.channel.lock().publish(&message);
        let span = ctx.span();

        if let Err(err) = result {
            error!(
                exchange = self.exchange,
                routing_key = self.routing_key,
                error = err.to_string(),
                "error publishing message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error publishing message"),
            });
            span.end();
            return Err(err);
        }

        let size = message.body.len();
        if self.tracked {
            info!(
                exchange = self.exchange,
                routing_key = self.routing_key,
                message_id = message.message_id,
                size,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                "message published"
            );
        } else {
            debug!(
                exchange = self.exchange,
                routing_key = self.routing_key,
                size,
                "message published"
            );
        }
        span.set_status(Status::Ok);
        span.end();

        Ok(PublishReceipt {
            message_id: message.message_id,
            exchange: message.exchange,
            routing_key: message.routing_key,
            size,
        })
    }
}

/// Callable publisher realized by a runtime for a registration taking `A`.
pub struct Publisher<A> {
    binding: Arc<PublisherBinding>,
    produce: Producer<A>,
}

impl<A> Clone for Publisher<A> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            produce: self.produce.clone(),
        }
    }
}

impl<A: 'static> Publisher<A> {
    /// Realizes `producer` over `binding`, failing when the registration was
    /// made for another argument type.
    pub(crate) fn realize(
        binding: Arc<PublisherBinding>,
        producer: &AnyProducer,
    ) -> Result<Self, MqError> {
        let produce = producer
            .downcast_ref::<Producer<A>>()
            .cloned()
            .ok_or(MqError::PublisherTypeMismatch(binding.registration))?;

        Ok(Self { binding, produce })
    }

    /// Calls the producer with `args` and publishes its result.
    pub fn publish(&self, args: A) -> Result<PublishReceipt, MqError> {
        let run = || {
            let started = Instant::now();
            let body = (self.produce)(args).map_err(|failure| {
                error!(
                    routing_key = self.binding.routing_key,
                    error = ?failure,
                    "failure to produce message"
                );
                match failure {
                    ProduceFailure::Producer(msg) => {
                        MqError::ProducerError(self.binding.registration, msg)
                    }
                    ProduceFailure::Serialize(_) => MqError::SerializePayloadError,
                }
            })?;

            self.binding.send(body, started)
        };

        match &self.binding.logger {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, run),
            None => run(),
        }
    }

    pub fn registration(&self) -> RegistrationId {
        self.binding.registration
    }

    pub fn exchange(&self) -> &str {
        self.binding.exchange()
    }

    pub fn routing_key(&self) -> &str {
        self.binding.routing_key()
    }
}
