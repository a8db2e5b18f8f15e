//! Incoming HTTP request type.
//!
//! A [`Request`] is a cheap, cloneable handle. Middleware, handlers, error
//! middleware and lifecycle hooks all see the *same* request: whatever an auth
//! middleware stores in the state bag (`req.insert_state("user", …)`) is
//! visible to every later stage, including the instrumentation layer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// An incoming HTTP request with its body already collected.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    peer: Option<SocketAddr>,
    local: Mutex<Local>,
}

#[derive(Default, Clone)]
struct Local {
    id: Option<String>,
    params: HashMap<String, String>,
    state: Map<String, Value>,
    extensions: http::Extensions,
}

impl Request {
    /// Builds a request from its parts. Used by the server, and by tests that
    /// drive an app in-process.
    pub fn from_parts(
        parts: http::request::Parts,
        body: Bytes,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
                peer,
                local: Mutex::new(Local::default()),
            }),
        }
    }

    /// Wraps an `http::Request` whose body is already in memory.
    ///
    /// ```rust
    /// use bytes::Bytes;
    /// use tsu_autolog::Request;
    ///
    /// let req = Request::from_http(
    ///     http::Request::post("/orders?page=2")
    ///         .header("content-type", "application/json")
    ///         .body(Bytes::from_static(br#"{"sku":"A-1"}"#))
    ///         .unwrap(),
    /// );
    /// assert_eq!(req.path(), "/orders");
    /// ```
    pub fn from_http(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::from_parts(parts, body, None)
    }

    /// Sets the peer address. Mostly useful in tests.
    ///
    /// If other handles to this request are alive, the result is a separate
    /// request that starts with a copy of the id, params, state and
    /// extensions.
    pub fn with_peer(self, peer: SocketAddr) -> Self {
        let inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| Inner {
            method: shared.method.clone(),
            uri: shared.uri.clone(),
            headers: shared.headers.clone(),
            body: shared.body.clone(),
            peer: shared.peer,
            local: Mutex::new(shared.local.lock().clone()),
        });
        Self { inner: Arc::new(Inner { peer: Some(peer), ..inner }) }
    }

    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn path(&self) -> &str { self.inner.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn body(&self) -> &[u8] { &self.inner.body }
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.inner.peer }

    /// Path plus query string, as the client sent it.
    pub fn url(&self) -> &str {
        self.inner.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Client address. Behind a reverse proxy the first `x-forwarded-for`
    /// entry wins over the socket peer.
    pub fn ip(&self) -> Option<String> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| self.inner.peer.map(|p| p.ip().to_string()))
    }

    /// Decoded query-string pairs. Repeated keys keep the last value.
    pub fn query(&self) -> Map<String, Value> {
        self.inner
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The body decoded by content type: JSON, url-encoded form, or text.
    /// Anything else (and an empty body) reads as `null`.
    pub fn body_value(&self) -> Value {
        let body = &self.inner.body;
        if body.is_empty() {
            return Value::Null;
        }
        let content_type = self.header("content-type").unwrap_or_default();
        if content_type.contains("json") {
            serde_json::from_slice(body).unwrap_or(Value::Null)
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            Value::Object(
                url::form_urlencoded::parse(body)
                    .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                    .collect(),
            )
        } else if content_type.starts_with("text/") {
            Value::String(String::from_utf8_lossy(body).into_owned())
        } else {
            Value::Null
        }
    }

    /// Request id, when the framework (or a middleware) assigned one.
    pub fn id(&self) -> Option<String> {
        self.inner.local.lock().id.clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.inner.local.lock().id = Some(id.into());
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<String> {
        self.inner.local.lock().params.get(key).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.inner.local.lock().params.clone()
    }

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        self.inner.local.lock().params = params;
    }

    /// Reads a value from the request's state bag.
    ///
    /// The bag is where middleware hangs per-request objects: `user`,
    /// `session`, `auth`, `account`, … The instrumentation layer looks for the
    /// caller's identity here.
    pub fn state(&self, key: &str) -> Option<Value> {
        self.inner.local.lock().state.get(key).cloned()
    }

    pub fn insert_state(&self, key: impl Into<String>, value: Value) {
        self.inner.local.lock().state.insert(key.into(), value);
    }

    /// A copy of the whole state bag.
    pub fn state_snapshot(&self) -> Map<String, Value> {
        self.inner.local.lock().state.clone()
    }

    /// Typed per-request extension, keyed by type.
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.local.lock().extensions.get::<T>().cloned()
    }

    pub fn insert_extension<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.inner.local.lock().extensions.insert(value);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(builder: http::request::Builder, body: &'static [u8]) -> Request {
        Request::from_http(builder.body(Bytes::from_static(body)).unwrap())
    }

    #[test]
    fn url_keeps_query_and_path_drops_it() {
        let req = request(http::Request::get("/orders?page=2&sort=asc"), b"");
        assert_eq!(req.url(), "/orders?page=2&sort=asc");
        assert_eq!(req.path(), "/orders");
        assert_eq!(req.query(), json!({"page": "2", "sort": "asc"}).as_object().cloned().unwrap());
    }

    #[test]
    fn ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let req = request(
            http::Request::get("/").header("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            b"",
        )
        .with_peer(peer);
        assert_eq!(req.ip().as_deref(), Some("203.0.113.7"));

        let direct = request(http::Request::get("/"), b"").with_peer(peer);
        assert_eq!(direct.ip().as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn body_value_decodes_by_content_type() {
        let json_req = request(
            http::Request::post("/").header("content-type", "application/json"),
            br#"{"a":1}"#,
        );
        assert_eq!(json_req.body_value(), json!({"a": 1}));

        let form = request(
            http::Request::post("/").header("content-type", "application/x-www-form-urlencoded"),
            b"name=alice&token=t",
        );
        assert_eq!(form.body_value(), json!({"name": "alice", "token": "t"}));

        let binary = request(
            http::Request::post("/").header("content-type", "application/octet-stream"),
            b"\x00\x01",
        );
        assert_eq!(binary.body_value(), Value::Null);
    }

    #[test]
    fn clones_share_state() {
        let req = request(http::Request::get("/"), b"");
        let other = req.clone();
        other.insert_state("user", json!({"id": 1}));
        other.set_id("req-1");
        assert_eq!(req.state("user"), Some(json!({"id": 1})));
        assert_eq!(req.id().as_deref(), Some("req-1"));
    }

    #[test]
    fn with_peer_on_a_shared_request_keeps_local_data() {
        let req = request(http::Request::get("/"), b"");
        req.set_id("req-7");
        req.insert_state("user", json!({"id": 1}));
        req.insert_extension(Arc::new(42u32));
        let held = req.clone();

        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let moved = req.with_peer(peer);
        assert_eq!(moved.peer_addr(), Some(peer));
        assert_eq!(moved.id().as_deref(), Some("req-7"));
        assert_eq!(moved.state("user"), Some(json!({"id": 1})));
        assert_eq!(moved.extension::<Arc<u32>>().as_deref(), Some(&42));
        assert_eq!(held.peer_addr(), None);
    }
}
