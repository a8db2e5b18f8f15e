//! Canonical request context.
//!
//! Each adapter snapshots its framework's request into a [`CanonicalRequest`];
//! the configured payload builder turns that into the context map that ends
//! up (redacted) in every request event.

use std::collections::HashMap;

use http::HeaderMap;
use serde_json::{Map, Value, json};

use super::config::Config;
use super::redact::redact_map;
use crate::request::Request;

/// Where a caller's identity may live in the request's state bag, in order.
const USER_SOURCES: &[&[&str]] = &[
    &["user"],
    &["auth", "user"],
    &["session", "user"],
    &["locals", "user"],
    &["context", "user"],
    &["currentUser"],
    &["account"],
    &["profile"],
];

/// A framework-agnostic, read-only view of one inbound request.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub ip: Option<String>,
    pub headers: HeaderMap,
    pub id: Option<String>,
    pub query: Map<String, Value>,
    pub params: HashMap<String, String>,
    pub body: Value,
    /// The request's state bag: `user`, `session`, `auth`, …
    pub state: Map<String, Value>,
}

impl CanonicalRequest {
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().to_string(),
            url: req.url().to_owned(),
            path: req.path().to_owned(),
            ip: req.ip(),
            headers: req.headers().clone(),
            id: req.id(),
            query: req.query(),
            params: req.params(),
            body: req.body_value(),
            state: req.state_snapshot(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Looks up a nested state value, e.g. `["session", "user"]`.
    pub fn state_at(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter().try_fold(self.state.get(*first)?, |value, key| value.get(key))
    }
}

/// The default payload builder.
///
/// Produces `method, url, path, ip, userAgent, requestId, user, admin,
/// session, query, params`. `user`, `admin` and `session` are `null` when
/// absent; `ip`, `userAgent` and `requestId` are left out. The session is
/// summarised as `{id}`; its contents never leave the process.
pub fn default_build_request_payload(req: &CanonicalRequest) -> Map<String, Value> {
    let request_id = req
        .id
        .clone()
        .or_else(|| req.header("x-request-id").map(str::to_owned));
    let session = req
        .state
        .get("session")
        .filter(|s| is_truthy(s))
        .map(|s| {
            let mut summary = Map::new();
            insert_present(&mut summary, "id", s.get("id").cloned());
            Value::Object(summary)
        });

    let mut context = Map::new();
    context.insert("method".into(), json!(req.method));
    context.insert("url".into(), json!(req.url));
    context.insert("path".into(), json!(req.path));
    insert_present(&mut context, "ip", req.ip.clone().map(Value::String));
    insert_present(&mut context, "userAgent", req.header("user-agent").map(Value::from));
    insert_present(&mut context, "requestId", request_id.map(Value::String));
    context.insert("user".into(), find_user(req).unwrap_or(Value::Null));
    context.insert("admin".into(), find_admin(req).unwrap_or(Value::Null));
    context.insert("session".into(), session.unwrap_or(Value::Null));
    context.insert("query".into(), Value::Object(req.query.clone()));
    context.insert("params".into(), json!(req.params));
    context
}

fn insert_present(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_owned(), value);
    }
}

/// First identity candidate that carries an `id`, `email` or `username`.
pub fn find_user(req: &CanonicalRequest) -> Option<Value> {
    USER_SOURCES
        .iter()
        .filter_map(|path| req.state_at(path))
        .find(|candidate| {
            ["id", "email", "username"]
                .iter()
                .any(|key| candidate.get(key).is_some_and(is_truthy))
        })
        .cloned()
}

/// Explicit `admin`, else a `user` flagged `isAdmin`, else `session.admin`.
pub fn find_admin(req: &CanonicalRequest) -> Option<Value> {
    let flagged_user = req
        .state_at(&["user"])
        .filter(|user| user.get("isAdmin").is_some_and(is_truthy));

    req.state_at(&["admin"])
        .filter(|v| is_truthy(v))
        .or(flagged_user)
        .or_else(|| req.state_at(&["session", "admin"]).filter(|v| is_truthy(v)))
        .cloned()
}

/// Runs the configured builder and context hook, then redacts the result.
///
/// Keys from the hook override the builder's.
pub(crate) fn build_context(config: &Config, req: &CanonicalRequest) -> Map<String, Value> {
    let mut context = (config.build_request_payload)(req);
    if let Some(extra) = config.context_hook.as_ref().and_then(|hook| hook(req)) {
        context.extend(extra);
    }
    redact_map(&context, &config.redact_fields)
}

/// Truthiness as the dynamic-language ecosystems these payloads come from
/// define it: `null`, `false`, `0` and `""` are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::config::Options;
    use crate::instrument::redact::REDACTED;
    use bytes::Bytes;

    fn canonical(builder: http::request::Builder, state: Value) -> CanonicalRequest {
        let req = Request::from_http(builder.body(Bytes::new()).unwrap());
        if let Value::Object(map) = state {
            for (key, value) in map {
                req.insert_state(key, value);
            }
        }
        CanonicalRequest::from_request(&req)
    }

    #[test]
    fn first_identity_candidate_wins() {
        let req = canonical(
            http::Request::get("/"),
            json!({"user": {"id": 1}, "session": {"id": "s1", "user": {"id": 2}}}),
        );
        assert_eq!(find_user(&req), Some(json!({"id": 1})));
    }

    #[test]
    fn candidates_without_identity_are_skipped() {
        let req = canonical(
            http::Request::get("/"),
            json!({
                "user": {"name": "anonymous"},
                "auth": {"user": {"id": 0}},
                "locals": {"user": {"email": "ada@example.com"}},
                "account": {"id": 9},
            }),
        );
        assert_eq!(find_user(&req), Some(json!({"email": "ada@example.com"})));

        let nobody = canonical(http::Request::get("/"), json!({"profile": {"bio": "hi"}}));
        assert_eq!(find_user(&nobody), None);
    }

    #[test]
    fn admin_resolution_order() {
        let explicit = canonical(http::Request::get("/"), json!({"admin": {"id": "a"}, "user": {"id": 1, "isAdmin": true}}));
        assert_eq!(find_admin(&explicit), Some(json!({"id": "a"})));

        let flagged = canonical(http::Request::get("/"), json!({"user": {"id": 1, "isAdmin": true}}));
        assert_eq!(find_admin(&flagged), Some(json!({"id": 1, "isAdmin": true})));

        let session = canonical(http::Request::get("/"), json!({"user": {"id": 1}, "session": {"admin": {"id": "s"}}}));
        assert_eq!(find_admin(&session), Some(json!({"id": "s"})));

        let none = canonical(http::Request::get("/"), json!({"user": {"id": 1, "isAdmin": false}}));
        assert_eq!(find_admin(&none), None);
    }

    #[test]
    fn default_payload_shape() {
        let req = canonical(
            http::Request::get("/orders/7?expand=items")
                .header("user-agent", "curl/8")
                .header("x-request-id", "abc-123"),
            json!({"session": {"id": "s1", "cart": [1, 2]}}),
        );
        let payload = default_build_request_payload(&req);
        assert_eq!(
            Value::Object(payload),
            json!({
                "method": "GET",
                "url": "/orders/7?expand=items",
                "path": "/orders/7",
                "userAgent": "curl/8",
                "requestId": "abc-123",
                "user": null,
                "admin": null,
                "session": {"id": "s1"},
                "query": {"expand": "items"},
                "params": {},
            })
        );
    }

    #[test]
    fn absent_client_details_are_left_out() {
        let req = canonical(http::Request::get("/"), json!({"session": {"cart": []}}));
        let payload = default_build_request_payload(&req);
        for key in ["ip", "userAgent", "requestId"] {
            assert!(!payload.contains_key(key), "{key} should be omitted");
        }
        assert_eq!(payload["user"], Value::Null);
        assert_eq!(payload["admin"], Value::Null);
        assert_eq!(payload["session"], json!({}));
    }

    #[test]
    fn context_hook_overrides_and_result_is_redacted() {
        let config = Config::default().merge(
            Options::new().context_hook(|req: &CanonicalRequest| {
                let mut extra = Map::new();
                extra.insert("method".into(), json!(format!("{}!", req.method)));
                extra.insert("tenantToken".into(), json!("t-1"));
                Some(extra)
            }),
        );
        let req = canonical(http::Request::post("/login"), json!({}));
        let context = build_context(&config, &req);
        assert_eq!(context["method"], json!("POST!"));
        assert_eq!(context["tenantToken"], json!(REDACTED));
    }

    #[test]
    fn custom_builder_replaces_default() {
        let config = Config::default().merge(Options::new().build_request_payload(
            |req: &CanonicalRequest| {
                let mut map = Map::new();
                map.insert("route".into(), json!(req.path));
                map
            },
        ));
        let req = canonical(http::Request::get("/x"), json!({}));
        assert_eq!(Value::Object(build_context(&config, &req)), json!({"route": "/x"}));
    }
}
