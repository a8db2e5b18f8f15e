//! Lifecycle apps: a router plus declarative request lifecycle hooks.
//!
//! Handlers return their response. Cross-cutting code does not wrap handlers;
//! it subscribes to lifecycle points instead:
//!
//! | Hook | Fires |
//! |---|---|
//! | `onRequest` | once, before routing |
//! | `onError` | when the handler returns `Err`, before the error reply is built |
//! | `onResponse` | exactly once, after the response is final |
//!
//! Every request gets a framework-assigned id (`req-1`, `req-2`, …) unless a
//! hook sets one first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{Method, StatusCode};
use serde_json::json;

use crate::error::{AppError, Error};
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::instrument::loader::Factory;
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::Router;
use crate::server::{Server, Service};

pub type OnRequest = Arc<dyn Fn(&Request) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&Request, &AppError) + Send + Sync>;
pub type OnResponse = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

/// A lifecycle hook registration.
#[derive(Clone)]
pub enum Hook {
    OnRequest(OnRequest),
    OnError(OnError),
    OnResponse(OnResponse),
}

#[derive(Default)]
struct Hooks {
    on_request: Vec<OnRequest>,
    on_error: Vec<OnError>,
    on_response: Vec<OnResponse>,
}

/// A lifecycle application instance.
pub struct Instance {
    router: Router<BoxedHandler>,
    hooks: Hooks,
    next_id: AtomicU64,
}

impl Instance {
    pub fn new() -> Self {
        Self { router: Router::new(), hooks: Hooks::default(), next_id: AtomicU64::new(1) }
    }

    /// The framework's module factory, as handed out by the module loader.
    pub fn factory() -> Factory<Instance> {
        Factory::new(Instance::new)
    }

    pub fn add_hook(&mut self, hook: Hook) -> &mut Self {
        let hooks = &mut self.hooks;
        match hook {
            Hook::OnRequest(f) => hooks.on_request.push(f),
            Hook::OnError(f) => hooks.on_error.push(f),
            Hook::OnResponse(f) => hooks.on_response.push(f),
        }
        self
    }

    pub fn on_request(&mut self, f: impl Fn(&Request) + Send + Sync + 'static) -> &mut Self {
        self.add_hook(Hook::OnRequest(Arc::new(f)))
    }

    pub fn on_error(&mut self, f: impl Fn(&Request, &AppError) + Send + Sync + 'static) -> &mut Self {
        self.add_hook(Hook::OnError(Arc::new(f)))
    }

    pub fn on_response(&mut self, f: impl Fn(&Request, &Response) + Send + Sync + 'static) -> &mut Self {
        self.add_hook(Hook::OnResponse(Arc::new(f)))
    }

    /// Registers a route handler. Path parameters use `{name}` syntax.
    ///
    /// # Panics
    ///
    /// Panics if `path` is invalid or conflicts with an existing route.
    pub fn route(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.router.insert(method, path, handler.into_boxed_handler());
        self
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.route(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.route(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.route(Method::PUT, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.route(Method::DELETE, path, handler)
    }

    /// Serves the instance until shutdown.
    pub async fn listen(self, addr: &str) -> Result<(), Error> {
        Server::bind(addr)?.serve(self).await
    }

    /// Runs one request through the lifecycle in-process, without a socket.
    pub async fn inject(&self, req: Request) -> Response {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if req.id().is_none() {
            req.set_id(format!("req-{id}"));
        }
        for hook in &self.hooks.on_request {
            hook(&req);
        }

        let response = match self.router.lookup(req.method(), req.path()) {
            Some((handler, params)) => {
                req.set_params(params);
                match handler.call(req.clone()).await {
                    Ok(response) => response,
                    Err(err) => {
                        for hook in &self.hooks.on_error {
                            hook(&req, &err);
                        }
                        error_reply(&err)
                    }
                }
            }
            None => not_found(&req),
        };

        for hook in &self.hooks.on_response {
            hook(&req, &response);
        }
        response
    }
}

impl Default for Instance {
    fn default() -> Self { Self::new() }
}

impl Service for Instance {
    fn call(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
        Box::pin(async move { self.inject(req).await })
    }
}

fn error_reply(err: &AppError) -> Response {
    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "statusCode": status.as_u16(),
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": err.message(),
    });
    (status, body).into_response()
}

fn not_found(req: &Request) -> Response {
    let body = json!({
        "message": format!("Route {}:{} not found", req.method(), req.path()),
        "error": "Not Found",
        "statusCode": 404,
    });
    (StatusCode::NOT_FOUND, body).into_response()
}
