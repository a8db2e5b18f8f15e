//! Chain apps: an ordered stack of middleware, routes and error middleware.
//!
//! Every request walks the stack top to bottom. A middleware decides whether
//! the walk continues by calling [`Next::run`]; a matching route ends it. When
//! a layer returns `Err`, the walk skips ahead to the next *error* middleware,
//! which may handle the error (emit a response and return `Ok`) or pass it on
//! by returning `Err` again.
//!
//! ```rust,no_run
//! use tsu_autolog::chain::App;
//!
//! # async fn run() -> Result<(), tsu_autolog::Error> {
//! let mut app = App::new();
//! app.use_middleware(|req, _reply, next: tsu_autolog::chain::Next| async move {
//!         req.insert_state("user", serde_json::json!({"id": 1}));
//!         next.run(req, _reply).await;
//!         Ok(())
//!     })
//!     .get("/orders", |_req, reply: tsu_autolog::chain::Reply| async move {
//!         reply.json(&serde_json::json!([]))?;
//!         Ok(())
//!     });
//! app.listen("0.0.0.0:3000").await
//! # }
//! ```
//!
//! Whatever is left unanswered at the bottom of the stack gets a final reply:
//! an unhandled error becomes a `5xx` (or the error's own status), no response
//! at all becomes `404 Cannot GET /path`. Both go out through [`Reply::send`],
//! so interceptors see them like any other response.

mod reply;

use std::future::Future;
use std::sync::{Arc, OnceLock};

use http::{Method, StatusCode};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{AppError, Error};
use crate::handler::BoxFuture;
use crate::instrument::loader::Factory;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::server::{Server, Service};

pub use reply::{Emission, Interceptor, Reply};

type LayerResult = Result<(), AppError>;

type MiddlewareFn = Arc<dyn Fn(Request, Reply, Next) -> BoxFuture<'static, LayerResult> + Send + Sync>;
type RouteFn = Arc<dyn Fn(Request, Reply) -> BoxFuture<'static, LayerResult> + Send + Sync>;
type ErrorFn = Arc<dyn Fn(AppError, Request, Reply, Next) -> BoxFuture<'static, LayerResult> + Send + Sync>;
type StartHook = Box<dyn FnOnce(&mut App) + Send + Sync>;

#[derive(Clone)]
enum Layer {
    Middleware(MiddlewareFn),
    Route { matcher: Arc<Router<()>>, handler: RouteFn },
    Error(ErrorFn),
}

/// A chain application.
///
/// Start hooks run on [`start`](App::start), which [`listen`](App::listen) and
/// [`Server::serve`] call. An app that is driven without being started starts
/// itself on its first request.
pub struct App {
    stack: Arc<Vec<Layer>>,
    start_hooks: Mutex<Vec<StartHook>>,
    started: bool,
    // Stack built by a start triggered from a shared `&App`.
    started_lazily: OnceLock<Arc<Vec<Layer>>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            stack: Arc::new(Vec::new()),
            start_hooks: Mutex::new(Vec::new()),
            started: false,
            started_lazily: OnceLock::new(),
        }
    }

    /// The framework's module factory, as handed out by the module loader.
    pub fn factory() -> Factory<App> {
        Factory::new(App::new)
    }

    /// Appends a middleware to the stack.
    pub fn use_middleware<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Request, Reply, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.push(Layer::Middleware(Arc::new(move |req, reply, next| Box::pin(f(req, reply, next)))))
    }

    /// Appends an error middleware. It only runs while an error is pending.
    pub fn use_error<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(AppError, Request, Reply, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.push(error_layer(f))
    }

    /// Inserts an error middleware ahead of every error middleware already on
    /// the stack, or appends it when there is none.
    pub(crate) fn use_error_first<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(AppError, Request, Reply, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.adopt_lazy_start();
        let stack = Arc::make_mut(&mut self.stack);
        let at = stack
            .iter()
            .position(|layer| matches!(layer, Layer::Error(_)))
            .unwrap_or(stack.len());
        stack.insert(at, error_layer(f));
        self
    }

    /// Appends a route. Path parameters use `{name}` syntax.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route pattern.
    pub fn route<F, Fut>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        let mut matcher = Router::new();
        matcher.insert(method, path, ());
        self.push(Layer::Route {
            matcher: Arc::new(matcher),
            handler: Arc::new(move |req, reply| Box::pin(handler(req, reply))),
        })
    }

    pub fn get<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.route(Method::POST, path, handler)
    }

    pub fn put<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.route(Method::PUT, path, handler)
    }

    pub fn delete<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Request, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LayerResult> + Send + 'static,
    {
        self.route(Method::DELETE, path, handler)
    }

    /// Queues `hook` to run when the app starts, after every route has been
    /// registered. Runs immediately if the app has already started.
    pub fn on_start(&mut self, hook: impl FnOnce(&mut App) + Send + Sync + 'static) -> &mut Self {
        self.adopt_lazy_start();
        if self.started {
            hook(self);
        } else {
            self.start_hooks.get_mut().push(Box::new(hook));
        }
        self
    }

    /// Runs the queued start hooks, once.
    pub fn start(&mut self) -> &mut Self {
        self.adopt_lazy_start();
        if !self.started {
            self.started = true;
            for hook in std::mem::take(self.start_hooks.get_mut()) {
                hook(self);
            }
        }
        self
    }

    pub fn is_started(&self) -> bool {
        self.started || self.started_lazily.get().is_some()
    }

    /// Starts the app and serves it until shutdown.
    pub async fn listen(mut self, addr: &str) -> Result<(), Error> {
        self.start();
        Server::bind(addr)?.serve(self).await
    }

    /// Runs one request through the stack in-process.
    pub async fn handle(&self, req: Request) -> Response {
        respond(self.running_stack(), req).await
    }

    /// The stack requests walk, starting the app first if nobody has.
    fn running_stack(&self) -> Arc<Vec<Layer>> {
        if self.started {
            return Arc::clone(&self.stack);
        }
        let stack = self.started_lazily.get_or_init(|| {
            let mut app = App::new();
            app.stack = Arc::clone(&self.stack);
            *app.start_hooks.get_mut() = std::mem::take(&mut *self.start_hooks.lock());
            app.start();
            app.stack
        });
        Arc::clone(stack)
    }

    /// Takes over the stack of a start that happened behind `&self`.
    fn adopt_lazy_start(&mut self) {
        if let Some(stack) = self.started_lazily.take() {
            self.stack = stack;
            self.started = true;
        }
    }

    fn push(&mut self, layer: Layer) -> &mut Self {
        self.adopt_lazy_start();
        Arc::make_mut(&mut self.stack).push(layer);
        self
    }
}

fn error_layer<F, Fut>(f: F) -> Layer
where
    F: Fn(AppError, Request, Reply, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LayerResult> + Send + 'static,
{
    Layer::Error(Arc::new(move |err, req, reply, next| Box::pin(f(err, req, reply, next))))
}

impl Default for App {
    fn default() -> Self { Self::new() }
}

impl Service for App {
    fn start(&mut self) {
        App::start(self);
    }

    fn call(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
        Box::pin(respond(self.running_stack(), req))
    }
}

// ── Next ──────────────────────────────────────────────────────────────────────

/// The rest of the stack, handed to each middleware.
pub struct Next {
    stack: Arc<Vec<Layer>>,
    index: usize,
    unhandled: Arc<Mutex<Option<AppError>>>,
}

impl Next {
    /// Continues the walk with the next matching layer.
    ///
    /// Resolves once the rest of the stack is done. Errors raised further
    /// down are routed to error middleware, not returned here.
    pub fn run(self, req: Request, reply: Reply) -> BoxFuture<'static, ()> {
        Box::pin(self.advance(req, reply, None))
    }

    fn at(&self, index: usize) -> Next {
        Next { stack: Arc::clone(&self.stack), index, unhandled: Arc::clone(&self.unhandled) }
    }

    async fn advance(self, req: Request, reply: Reply, mut pending: Option<AppError>) {
        let mut index = self.index;
        while let Some(layer) = self.stack.get(index) {
            index += 1;
            let outcome = match (layer, pending.take()) {
                (Layer::Middleware(mw), None) => mw(req.clone(), reply.clone(), self.at(index)).await,
                (Layer::Route { matcher, handler }, None) => {
                    let Some(((), params)) = matcher.lookup(req.method(), req.path()) else {
                        continue;
                    };
                    req.set_params(params);
                    handler(req.clone(), reply.clone()).await
                }
                (Layer::Error(handler), Some(err)) => {
                    handler(err, req.clone(), reply.clone(), self.at(index)).await
                }
                (_, skipped) => {
                    pending = skipped;
                    continue;
                }
            };
            match outcome {
                Ok(()) => return,
                Err(err) => pending = Some(err),
            }
        }
        if let Some(err) = pending {
            *self.unhandled.lock() = Some(err);
        }
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

async fn respond(stack: Arc<Vec<Layer>>, req: Request) -> Response {
    let reply = Reply::new();
    let unhandled = Arc::new(Mutex::new(None));
    Next { stack, index: 0, unhandled: Arc::clone(&unhandled) }
        .run(req.clone(), reply.clone())
        .await;

    let pending = unhandled.lock().take();
    finish(&req, &reply, pending);
    reply.to_response()
}

/// The reply of last resort for anything the stack left unanswered.
fn finish(req: &Request, reply: &Reply, pending: Option<AppError>) {
    if reply.is_sent() {
        if let Some(err) = pending {
            warn!(method = %req.method(), path = req.path(), "error raised after response was sent: {err}");
        }
        return;
    }

    let sent = match pending {
        Some(err) => {
            let current = reply.status_code();
            let status = err
                .status()
                .or_else(|| (current.as_u16() >= 400).then_some(current))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error!(method = %req.method(), path = req.path(), status = status.as_u16(), "unhandled error: {err}");
            reply
                .status(status)
                .send(status.canonical_reason().unwrap_or("Internal Server Error"))
        }
        None => reply
            .status(StatusCode::NOT_FOUND)
            .send(format!("Cannot {} {}", req.method(), req.path())),
    };

    if let Err(e) = sent {
        warn!("final reply failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn get(path: &str) -> Request {
        Request::from_http(http::Request::get(path).body(Bytes::new()).unwrap())
    }

    #[tokio::test]
    async fn middleware_runs_before_route_and_shares_state() {
        let mut app = App::new();
        app.use_middleware(|req: Request, reply, next: Next| async move {
            req.insert_state("user", json!({"id": 7}));
            next.run(req, reply).await;
            Ok(())
        })
        .get("/users/{id}", |req: Request, reply: Reply| async move {
            reply.json(&json!({"param": req.param("id"), "user": req.state("user")}))?;
            Ok(())
        });

        let res = app.handle(get("/users/42")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body_value(), json!({"param": "42", "user": {"id": 7}}));
    }

    #[tokio::test]
    async fn unmatched_request_gets_404() {
        let app = App::new();
        let res = app.handle(get("/nowhere")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.body(), b"Cannot GET /nowhere");
    }

    #[tokio::test]
    async fn errors_skip_to_error_middleware() {
        let skipped = Arc::new(Mutex::new(true));
        let flag = Arc::clone(&skipped);
        let mut app = App::new();
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("kaput")) })
            .use_middleware(move |_req, _reply, _next| {
                *flag.lock() = false;
                async move { Ok(()) }
            })
            .use_error(|err: AppError, _req, reply: Reply, _next| async move {
                reply.status(StatusCode::BAD_GATEWAY).send(err.message().to_owned())?;
                Ok(())
            });

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(res.body(), b"kaput");
        assert!(*skipped.lock(), "plain middleware ran while an error was pending");
    }

    #[tokio::test]
    async fn unhandled_error_uses_error_status_or_500() {
        let mut app = App::new();
        app.get("/teapot", |_req, _reply| async move {
            Err(AppError::new("short and stout").with_status(StatusCode::IM_A_TEAPOT))
        })
        .get("/boom", |_req, _reply| async move { Err(AppError::new("db timeout")) });

        assert_eq!(app.handle(get("/teapot")).await.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            app.handle(get("/boom")).await.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn start_hooks_run_once_after_routes() {
        let mut app = App::new();
        app.on_start(|app| {
            app.use_error(|_err, _req, reply: Reply, _next| async move {
                reply.status(StatusCode::SERVICE_UNAVAILABLE).end()?;
                Ok(())
            });
        });
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("x")) });
        app.start().start();

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(app.is_started());
    }

    #[tokio::test]
    async fn served_app_runs_start_hooks_without_explicit_start() {
        let mut app = App::new();
        app.on_start(|app| {
            app.get("/late", |_req, reply: Reply| async move {
                reply.send("registered at start")?;
                Ok(())
            });
        });
        assert!(!app.is_started());

        let app = Arc::new(app);
        let res = Service::call(Arc::clone(&app), get("/late")).await;
        assert_eq!(res.body(), b"registered at start");
        assert!(app.is_started());
    }

    #[tokio::test]
    async fn start_hooks_run_once_across_lazy_and_explicit_start() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut app = App::new();
        app.on_start(move |_app| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        app.handle(get("/a")).await;
        app.handle(get("/b")).await;
        app.start();
        Service::start(&mut app);
        app.get("/c", |_req, reply: Reply| async move {
            reply.end()?;
            Ok(())
        });

        assert_eq!(app.handle(get("/c")).await.status_code(), StatusCode::OK);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_layer_inserted_first_runs_before_user_error_middleware() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (user, first) = (Arc::clone(&seen), Arc::clone(&seen));
        let mut app = App::new();
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("kaput")) })
            .use_error(move |err: AppError, _req, reply: Reply, _next| {
                user.lock().push("user");
                async move {
                    reply.send(err.message().to_owned())?;
                    Ok(())
                }
            });
        app.use_error_first(move |err: AppError, _req, _reply, _next| {
            first.lock().push("first");
            std::future::ready(Err(err))
        });

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.body(), b"kaput");
        assert_eq!(*seen.lock(), vec!["first", "user"]);
    }
}
