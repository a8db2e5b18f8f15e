//! The chain app's response object.
//!
//! Unlike lifecycle handlers, chain handlers do not *return* a response; they
//! *emit* one through a [`Reply`] using one of three operations: [`send`],
//! [`json`] or [`end`]. Only the first emission reaches the client. Later ones
//! fail with [`Error::ResponseAlreadySent`].
//!
//! Interceptors registered with [`Reply::intercept`] run before every emission
//! attempt, successful or not, and see the emitted payload.
//!
//! [`send`]: Reply::send
//! [`json`]: Reply::json
//! [`end`]: Reply::end

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::response::Response;

/// Callback run before each response-emitting call.
pub type Interceptor = Arc<dyn Fn(&Reply, &Emission<'_>) + Send + Sync + 'static>;

/// One response-emitting call, as seen by an interceptor.
#[derive(Debug)]
pub enum Emission<'a> {
    Send(&'a [u8]),
    Json(&'a Value),
    End,
}

impl Emission<'_> {
    /// The emitted payload as a loggable value. `end` carries none.
    pub fn body_value(&self) -> Option<Value> {
        match self {
            Self::Send(body) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
            Self::Json(value) => Some((*value).clone()),
            Self::End => None,
        }
    }
}

/// Handle to the response being built for one request. Cheap to clone.
#[derive(Clone)]
pub struct Reply {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    interceptors: Mutex<Vec<Interceptor>>,
}

struct State {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    sent: bool,
}

impl Reply {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                    sent: false,
                }),
                interceptors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Sets the status code. Defaults to `200 OK`.
    pub fn status(&self, code: StatusCode) -> &Self {
        self.inner.state.lock().status = code;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.inner.state.lock().status
    }

    /// Sets a header, replacing earlier values. Invalid names or values are dropped.
    pub fn header(&self, name: &str, value: &str) -> &Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.inner.state.lock().headers.insert(name, value);
        }
        self
    }

    /// Whether a response has already been emitted.
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Sends a raw body. Defaults the content type to `text/html`.
    pub fn send(&self, body: impl Into<Bytes>) -> Result<(), Error> {
        let body = body.into();
        self.notify(&Emission::Send(&body));
        self.commit(body, "text/html; charset=utf-8")
    }

    /// Serialises `value` and sends it as `application/json`.
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), Error> {
        let value = serde_json::to_value(value)?;
        self.notify(&Emission::Json(&value));
        self.commit(Bytes::from(serde_json::to_vec(&value)?), "application/json")
    }

    /// Ends the response without a body.
    pub fn end(&self) -> Result<(), Error> {
        self.notify(&Emission::End);
        let mut state = self.inner.state.lock();
        if state.sent {
            return Err(Error::ResponseAlreadySent);
        }
        state.sent = true;
        Ok(())
    }

    /// Registers a callback that runs before every `send`, `json` and `end`.
    pub fn intercept(&self, f: impl Fn(&Reply, &Emission<'_>) + Send + Sync + 'static) {
        self.inner.interceptors.lock().push(Arc::new(f));
    }

    /// Snapshot of what the client receives.
    pub(crate) fn to_response(&self) -> Response {
        let state = self.inner.state.lock();
        Response::from_parts(state.status, state.headers.clone(), state.body.clone())
    }

    fn notify(&self, emission: &Emission<'_>) {
        // Clone the list so interceptors may touch the reply without deadlocking.
        let interceptors = self.inner.interceptors.lock().clone();
        for interceptor in interceptors {
            interceptor(self, emission);
        }
    }

    fn commit(&self, body: Bytes, content_type: &'static str) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.sent {
            return Err(Error::ResponseAlreadySent);
        }
        if !state.headers.contains_key(CONTENT_TYPE) {
            state.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        state.body = body;
        state.sent = true;
        Ok(())
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Reply")
            .field("status", &state.status)
            .field("sent", &state.sent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use serde_json::json;

    #[test]
    fn only_first_emission_is_committed() {
        let reply = Reply::new();
        reply.status(StatusCode::CREATED).json(&json!({"id": 1})).unwrap();
        assert!(matches!(reply.send("again"), Err(Error::ResponseAlreadySent)));
        assert!(matches!(reply.end(), Err(Error::ResponseAlreadySent)));

        let res = reply.to_response();
        assert_eq!(res.status_code(), StatusCode::CREATED);
        assert_eq!(res.body_value(), json!({"id": 1}));
    }

    #[test]
    fn interceptors_see_every_attempt() {
        let reply = Reply::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        reply.intercept(move |reply, emission| {
            assert_eq!(reply.status_code(), StatusCode::OK);
            if matches!(emission, Emission::Send(_)) {
                assert_eq!(emission.body_value(), Some(json!("hello")));
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        reply.send("hello").unwrap();
        let _ = reply.end();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
