//! Instrumentation for lifecycle apps, through the three native hooks.
//!
//! The framework fires `onResponse` exactly once per request, so unlike the
//! chain adapter nothing here patches the response path.

use std::sync::Arc;

use http::StatusCode;
use serde_json::Value;

use super::Autolog;
use super::adapter::{Adapter, Recorder};
use crate::error::AppError;
use crate::lifecycle::Instance;
use crate::request::Request;

pub struct LifecycleAdapter {
    recorder: Recorder,
}

impl LifecycleAdapter {
    pub fn new(autolog: Arc<Autolog>) -> Arc<Self> {
        Arc::new(Self { recorder: Recorder::new(autolog) })
    }
}

impl Adapter for LifecycleAdapter {
    type Target = Instance;

    fn attach(self: Arc<Self>, instance: &mut Instance) {
        let (start, error) = (Arc::clone(&self), Arc::clone(&self));
        instance
            .on_request(move |req| {
                start.on_request_start(req);
            })
            .on_error(move |req, err| error.on_request_error(req, err))
            .on_response(move |req, res| self.on_request_complete(req, res.status_code(), None));
    }

    fn on_request_start(&self, req: &Request) -> bool {
        self.recorder.start(req)
    }

    fn on_request_error(&self, req: &Request, err: &AppError) {
        self.recorder.capture(req, err);
    }

    fn on_request_complete(&self, req: &Request, status: StatusCode, body: Option<Value>) {
        self.recorder.complete(req, status, body);
    }
}
