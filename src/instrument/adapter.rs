//! The seam between a framework and the event pipeline.
//!
//! An [`Adapter`] knows one framework's extension points and reports three
//! moments per request: start, error and completion. Everything after that
//! (payload, suppression, classification, redaction, delivery) lives in
//! [`Recorder`], shared by every adapter.

use std::sync::Arc;

use http::StatusCode;
use serde_json::Value;
use tracing::trace;

use super::classify::{classify, is_slow};
use super::event::{ErrorDetails, LogEvent, RequestRecord};
use super::payload::{CanonicalRequest, build_context};
use super::redact::redact;
use super::trace::RequestTrace;
use super::{Autolog, contain};
use crate::error::AppError;
use crate::request::Request;

/// What the suppression predicate sees of a finished request.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub status: StatusCode,
    pub response_time_ms: u64,
    /// The emitted payload, when the framework exposes one.
    pub body: Option<Value>,
}

pub trait Adapter: Send + Sync + 'static {
    /// The framework object this adapter instruments.
    type Target;

    /// Hooks the adapter into `target`.
    fn attach(self: Arc<Self>, target: &mut Self::Target);

    /// Starts tracing `req`. Returns `false` when the request is ignored or
    /// already traced by another adapter.
    fn on_request_start(&self, req: &Request) -> bool;

    fn on_request_error(&self, req: &Request, err: &AppError);

    fn on_request_complete(&self, req: &Request, status: StatusCode, body: Option<Value>);
}

/// The shared request pipeline.
pub struct Recorder {
    autolog: Arc<Autolog>,
    id: u64,
}

impl Recorder {
    pub fn new(autolog: Arc<Autolog>) -> Self {
        let id = autolog.next_adapter_id();
        Self { autolog, id }
    }

    pub fn start(&self, req: &Request) -> bool {
        if RequestTrace::of(req).is_some_and(|t| t.owner() != self.id) {
            return false;
        }
        if self.autolog.config().is_ignored_path(req.path()) {
            trace!(path = req.path(), "ignored path");
            return false;
        }
        RequestTrace::attach(req, self.id);
        true
    }

    /// Whether `req` is being traced by this recorder.
    pub fn owns(&self, req: &Request) -> bool {
        self.trace(req).is_some()
    }

    pub fn capture(&self, req: &Request, err: &AppError) {
        if let Some(trace) = self.trace(req) {
            trace.capture_error(ErrorDetails::from(err));
        }
    }

    /// Builds and delivers the request's event, at most once per request.
    pub fn complete(&self, req: &Request, status: StatusCode, body: Option<Value>) {
        let Some(trace) = self.trace(req) else { return };
        if !trace.mark_logged() {
            return;
        }
        contain("request event", || self.emit(req, &trace, status, body));
    }

    fn trace(&self, req: &Request) -> Option<Arc<RequestTrace>> {
        RequestTrace::of(req).filter(|t| t.owner() == self.id)
    }

    fn emit(&self, req: &Request, trace: &RequestTrace, status: StatusCode, body: Option<Value>) {
        let Some(sink) = self.autolog.sink() else { return };
        let config = self.autolog.config();
        let elapsed = trace.elapsed_ms();

        let canonical = CanonicalRequest::from_request(req);
        let context = build_context(&config, &canonical);
        let completed = CompletedResponse { status, response_time_ms: elapsed, body };

        if config.should_ignore.as_ref().is_some_and(|ignore| ignore(&canonical, &completed)) {
            trace!(path = %canonical.path, "event suppressed");
            return;
        }

        let error = trace.error();
        let threshold = config.slow_request_threshold_ms;
        let outcome = classify(status.as_u16(), elapsed, threshold, error.as_ref());

        let event = LogEvent {
            title: format!("{} {}", canonical.method, canonical.url),
            message: outcome.message,
            level: outcome.level,
            request: Some(RequestRecord {
                context,
                body: redact(&canonical.body, &config.redact_fields),
                response: completed.body.map(|b| redact(&b, &config.redact_fields)),
                response_time_ms: elapsed,
                status_code: status.as_u16(),
                is_slow: is_slow(elapsed, threshold),
            }),
            error,
        };
        sink.emit(event);
    }
}
