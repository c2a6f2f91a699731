// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Wrapper
//!
//! This module turns a raw delivery into a call of the application handler.
//! For every delivery the wrapper:
//! 1. Extracts the trace context from the headers and opens a consumer span
//! 2. Starts a timer when the registration is tracked
//! 3. Decodes the JSON payload and invokes the handler, catching panics
//! 4. Acks the message when the handler succeeded
//! 5. Nacks it otherwise, requeuing only handler failures and only when configured
//!
//! A failing handler never unwinds into the receive loop of its channel.

use crate::{
    broker::{Acknowledgement, Delivery, DeliveryCallback},
    errors::HandlerError,
    otel,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
};
use serde::de::DeserializeOwned;
use std::{
    any::Any,
    borrow::Cow,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Why a handler did not process a delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsumeFailure {
    #[error("failure to decode payload: {0}")]
    Decode(String),

    #[error("handler failure: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panic(String),
}

/// Type-erased handler stored in a registration.
pub(crate) trait ConsumeHandler: Send + Sync {
    fn handle(&self, body: &[u8]) -> Result<(), ConsumeFailure>;
}

struct JsonHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> ConsumeHandler for JsonHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, body: &[u8]) -> Result<(), ConsumeFailure> {
        let payload: T =
            serde_json::from_slice(body).map_err(|err| ConsumeFailure::Decode(err.to_string()))?;

        (self.handler)(payload).map_err(|err| ConsumeFailure::Handler(err.to_string()))
    }
}

pub(crate) fn json_handler<T, F>(handler: F) -> Arc<dyn ConsumeHandler>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(JsonHandler {
        handler,
        _payload: PhantomData,
    })
}

/// A consumer registration resolved for one queue of a runtime.
pub(crate) struct ConsumerWrapper {
    queue: String,
    handler: Arc<dyn ConsumeHandler>,
    tracked: bool,
    requeue_on_failure: bool,
    tracer: BoxedTracer,
}

impl ConsumerWrapper {
    pub(crate) fn new(
        queue: &str,
        handler: Arc<dyn ConsumeHandler>,
        tracked: bool,
        requeue_on_failure: bool,
    ) -> Self {
        Self {
            queue: queue.to_owned(),
            handler,
            tracked,
            requeue_on_failure,
            tracer: global::tracer(otel::CONSUMER_TRACER),
        }
    }

    /// Processes one delivery and tells the channel how to acknowledge it.
    pub(crate) fn on_delivery(&self, delivery: &Delivery) -> Acknowledgement {
        let (parent, span) = otel::new_consumer_span(&delivery.headers, &self.tracer, &self.queue);
        let ctx = parent.with_span(span);
        let started = self.tracked.then(Instant::now);

        debug!(
            queue = self.queue,
            delivery_tag = delivery.delivery_tag,
            exchange = delivery.exchange,
            redelivered = delivery.redelivered,
            "received message"
        );

        let result = {
            let _attached = ctx.clone().attach();
            panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&delivery.body)))
                .unwrap_or_else(|payload| Err(ConsumeFailure::Panic(panic_message(&*payload))))
        };

        let elapsed_ms = started.map(|s| s.elapsed().as_secs_f64() * 1000.0);
        let span = ctx.span();

        let ack = match result {
            Ok(()) => {
                span.set_status(Status::Ok);
                match elapsed_ms {
                    Some(elapsed_ms) => info!(
                        queue = self.queue,
                        delivery_tag = delivery.delivery_tag,
                        elapsed_ms,
                        "message successfully processed"
                    ),
                    None => debug!(queue = self.queue, "message successfully processed"),
                }
                Acknowledgement::Ack
            }
            Err(failure) => {
                span.record_error(&failure);
                span.set_status(Status::Error {
                    description: Cow::from(failure.to_string()),
                });

                let requeue = match failure {
                    ConsumeFailure::Decode(_) => false,
                    ConsumeFailure::Handler(_) | ConsumeFailure::Panic(_) => {
                        self.requeue_on_failure
                    }
                };

                error!(
                    queue = self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = failure.to_string(),
                    elapsed_ms,
                    requeue,
                    "failure to handle message"
                );
                Acknowledgement::Nack { requeue }
            }
        };

        span.end();
        ack
    }

    pub(crate) fn into_callback(self) -> DeliveryCallback {
        Box::new(move |delivery: &Delivery| self.on_delivery(delivery))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
