// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the message headers. Publishers inject the current
//! context, consumers extract it and start a consumer span as its child.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Writes trace context entries into message headers.
pub(crate) struct HeadersInjector<'a> {
    headers: &'a mut Map<String, Value>,
}

impl<'a> HeadersInjector<'a> {
    pub(crate) fn new(headers: &'a mut Map<String, Value>) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), Value::String(value));
    }
}

/// Reads trace context entries from message headers. Only string headers are
/// considered.
pub(crate) struct HeadersExtractor<'a> {
    headers: &'a Map<String, Value>,
}

impl<'a> HeadersExtractor<'a> {
    pub(crate) fn new(headers: &'a Map<String, Value>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeadersExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current context into outgoing headers.
pub(crate) fn inject_context(headers: &mut Map<String, Value>) {
    let ctx = Context::current();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeadersInjector::new(headers))
    });
}

/// Starts a consumer span, child of the context found in `headers`.
pub(crate) fn new_span(
    headers: &Map<String, Value>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Map::new();
        HeadersInjector::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(headers.get("traceparent"), Some(&Value::from("00-abc")));
    }

    #[test]
    fn extractor_reads_string_headers_only() {
        let mut headers = Map::new();
        headers.insert("traceparent".to_owned(), Value::from("00-abc"));
        headers.insert("count".to_owned(), Value::from(3));
        let extractor = HeadersExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("count"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
