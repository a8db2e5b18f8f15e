//! Instrumentation for chain apps.
//!
//! Three touch points:
//!
//! 1. a logging middleware, registered first, that starts the trace and
//!    intercepts the request's [`Reply`];
//! 2. the reply interceptor, which logs on the first `send`, `json` or `end`
//!    and lets every later call through untouched;
//! 3. an error middleware, added when the app starts below every user route
//!    and ahead of every user error middleware, that records the error on the
//!    trace and passes it on.

use std::future::ready;
use std::sync::Arc;

use http::StatusCode;
use serde_json::Value;

use super::Autolog;
use super::adapter::{Adapter, Recorder};
use crate::chain::{App, Next, Reply};
use crate::error::AppError;
use crate::request::Request;

pub struct ChainAdapter {
    recorder: Recorder,
}

impl ChainAdapter {
    pub fn new(autolog: Arc<Autolog>) -> Arc<Self> {
        Arc::new(Self { recorder: Recorder::new(autolog) })
    }

    fn intercept(self: &Arc<Self>, req: &Request, reply: &Reply) {
        let adapter = Arc::clone(self);
        let req = req.clone();
        reply.intercept(move |reply, emission| {
            adapter.on_request_complete(&req, reply.status_code(), emission.body_value());
        });
    }
}

impl Adapter for ChainAdapter {
    type Target = App;

    fn attach(self: Arc<Self>, app: &mut App) {
        let adapter = Arc::clone(&self);
        app.use_middleware(move |req: Request, reply: Reply, next: Next| {
            if adapter.on_request_start(&req) {
                adapter.intercept(&req, &reply);
            }
            async move {
                next.run(req, reply).await;
                Ok(())
            }
        });

        app.on_start(move |app| {
            app.use_error_first(move |err: AppError, req: Request, reply: Reply, _next: Next| {
                if self.recorder.owns(&req) {
                    self.on_request_error(&req, &err);
                    if reply.status_code() == StatusCode::OK {
                        reply.status(err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
                    }
                }
                ready(Err(err))
            });
        });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::event::Level;
    use crate::instrument::{MemorySink, Options};
    use bytes::Bytes;
    use serde_json::json;

    fn instrumented(sink: &Arc<MemorySink>) -> App {
        let autolog = Autolog::new();
        autolog.configure(sink.clone(), Options::new());
        let mut app = App::new();
        ChainAdapter::new(autolog).attach(&mut app);
        app
    }

    fn get(path: &str) -> Request {
        Request::from_http(http::Request::get(path).body(Bytes::new()).unwrap())
    }

    #[tokio::test]
    async fn second_emission_is_not_logged() {
        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.get("/twice", |_req, reply: Reply| async move {
            reply.json(&json!({"first": true}))?;
            let _ = reply.send("second");
            Ok(())
        });
        app.start();

        let res = app.handle(get("/twice")).await;
        assert_eq!(res.body_value(), json!({"first": true}));

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request.as_ref().unwrap().response, Some(json!({"first": true})));
    }

    #[tokio::test]
    async fn unmatched_request_is_logged_as_not_found() {
        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.start();

        app.handle(get("/missing")).await;
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::Error);
        assert_eq!(events[0].message, "Route not found");
    }

    #[tokio::test]
    async fn error_status_set_by_handler_is_kept() {
        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.post("/orders", |_req, reply: Reply| async move {
            reply.status(StatusCode::UNPROCESSABLE_ENTITY);
            Err(AppError::new("quantity must be positive").with_name("ValidationError"))
        });
        app.start();

        let res = app.handle(Request::from_http(
            http::Request::post("/orders").body(Bytes::new()).unwrap(),
        ))
        .await;
        assert_eq!(res.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let event = &sink.take()[0];
        assert_eq!(event.level, Level::Error);
        assert_eq!(event.message, "quantity must be positive");
        assert_eq!(event.error.as_ref().map(|e| e.name.as_str()), Some("ValidationError"));
    }

    #[tokio::test]
    async fn user_error_middleware_still_runs() {
        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("db timeout")) })
            .use_error(|err: AppError, _req, reply: Reply, _next| async move {
                reply.json(&json!({"failed": err.message()}))?;
                Ok(())
            });
        app.start();

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body_value(), json!({"failed": "db timeout"}));

        let event = &sink.take()[0];
        assert_eq!(event.level, Level::Critical);
        assert_eq!(event.message, "db timeout");
        assert_eq!(event.error.as_ref().map(|e| e.message.as_str()), Some("db timeout"));
    }

    #[tokio::test]
    async fn error_middleware_added_after_start_also_sees_the_captured_error() {
        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("db timeout")) });
        app.start();
        app.use_error(|_err: AppError, _req, reply: Reply, _next| async move {
            reply.send("sorry")?;
            Ok(())
        });

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let event = &sink.take()[0];
        assert_eq!(event.level, Level::Critical);
        assert_eq!(event.error.as_ref().map(|e| e.message.as_str()), Some("db timeout"));
    }

    #[tokio::test]
    async fn typed_json_reply_is_converted_then_redacted() {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Session {
            user: &'static str,
            refresh_token: &'static str,
        }

        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.post("/sessions", |_req, reply: Reply| async move {
            reply.json(&Session { user: "ada", refresh_token: "r-1" })?;
            Ok(())
        });
        app.start();

        app.handle(Request::from_http(
            http::Request::post("/sessions").body(Bytes::new()).unwrap(),
        ))
        .await;

        let event = &sink.take()[0];
        assert_eq!(
            event.request.as_ref().unwrap().response,
            Some(json!({"user": "ada", "refreshToken": crate::instrument::REDACTED}))
        );
    }

    #[tokio::test]
    async fn unstarted_app_served_as_a_service_captures_errors() {
        use crate::server::Service;

        let sink = Arc::new(MemorySink::new());
        let mut app = instrumented(&sink);
        app.get("/boom", |_req, _reply| async move { Err(AppError::new("db timeout")) });

        let res = Service::call(Arc::new(app), get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let event = &sink.take()[0];
        assert_eq!(event.level, Level::Critical);
        assert_eq!(event.message, "db timeout");
        assert_eq!(event.error.as_ref().map(|e| e.message.as_str()), Some("db timeout"));
    }
}
