// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers. Publishers
//! inject the context of the current producer span into the outgoing headers;
//! consumers extract it from the delivery and continue the trace in a consumer span.

use crate::broker::Headers;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::borrow::Cow;

/// Instrumentation scope of the consumer spans.
pub(crate) const CONSUMER_TRACER: &str = "mq consumer";
/// Instrumentation scope of the producer spans.
pub(crate) const PUBLISHER_TRACER: &str = "mq publisher";

/// Writes trace context entries into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates the span of a delivery, parented on the context found in its headers.
pub(crate) fn new_consumer_span(
    headers: &Headers,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Starts a producer span under the current context and injects it into `headers`.
///
/// The returned context holds the span; end it through [`TraceContextExt::span`].
pub(crate) fn inject_producer_span(
    headers: &mut Headers,
    tracer: &BoxedTracer,
    name: &str,
) -> Context {
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Producer)
        .start_with_context(tracer, &Context::current());
    let ctx = Context::current().with_span(span);

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(headers))
    });

    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("00-abc"));
    }

    #[test]
    fn test_extractor_reads_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), "00-abc".to_owned());
        headers.insert("kind".to_owned(), "order".to_owned());

        let extractor = HeaderExtractor::new(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys(), vec!["kind", "traceparent"]);
    }
}
