use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::event::ErrorDetails;
use crate::request::Request;

/// Per-request instrumentation state, stored in the request's extensions.
///
/// Created when a request begins and dropped with the request. `owner`
/// identifies the adapter that started it, so a second adapter on the same
/// app leaves the request alone.
#[derive(Debug)]
pub struct RequestTrace {
    owner: u64,
    start: Instant,
    error: Mutex<Option<ErrorDetails>>,
    logged: AtomicBool,
}

impl RequestTrace {
    pub fn new(owner: u64) -> Self {
        Self { owner, start: Instant::now(), error: Mutex::new(None), logged: AtomicBool::new(false) }
    }

    /// Starts a trace for `req`, replacing any stale one.
    pub fn attach(req: &Request, owner: u64) -> Arc<Self> {
        let trace = Arc::new(Self::new(owner));
        req.insert_extension(Arc::clone(&trace));
        trace
    }

    pub fn of(req: &Request) -> Option<Arc<Self>> {
        req.extension::<Arc<Self>>()
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn capture_error(&self, error: ErrorDetails) {
        *self.error.lock() = Some(error);
    }

    pub fn error(&self) -> Option<ErrorDetails> {
        self.error.lock().clone()
    }

    /// Claims the right to log this request. `true` exactly once.
    pub fn mark_logged(&self) -> bool {
        !self.logged.swap(true, Ordering::AcqRel)
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn trace_lives_on_the_request() {
        let req = Request::from_http(http::Request::get("/").body(Bytes::new()).unwrap());
        assert!(RequestTrace::of(&req).is_none());

        RequestTrace::attach(&req, 7);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let trace = RequestTrace::of(&req).unwrap();
        assert_eq!(trace.owner(), 7);
        assert_eq!(trace.elapsed_ms(), 120);
    }

    #[test]
    fn logged_guard_fires_once() {
        let trace = RequestTrace::new(1);
        assert!(trace.mark_logged());
        assert!(!trace.mark_logged());
    }
}
