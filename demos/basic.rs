//! Instrumented chain app: every request is logged without a logging call in
//! sight.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/orders/42
//!   curl -X POST http://localhost:3000/login \
//!        -H 'content-type: application/json' \
//!        -d '{"username":"ada","password":"hunter2"}'   # password is redacted
//!   curl http://localhost:3000/slow                    # warning after 1.5 s
//!   curl http://localhost:3000/boom                    # critical, with error
//!   curl http://localhost:3000/health                  # never logged

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tsu_autolog::chain::{Next, Reply};
use tsu_autolog::instrument::loader::{CHAIN_ID, ModuleLoader};
use tsu_autolog::instrument::{self, Autolog, Options, TracingSink, process};
use tsu_autolog::{AppError, Error, Request};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    // Hook first, framework second.
    instrument::install();
    let autolog = Autolog::global();
    autolog.configure(
        Arc::new(TracingSink),
        Options::from_env().context_hook(|req| {
            let tenant = req.header("x-tenant")?;
            let mut extra = serde_json::Map::new();
            extra.insert("tenant".into(), json!(tenant));
            Some(extra)
        }),
    );
    process::install_panic_hook(Arc::clone(autolog));

    let factory = ModuleLoader::global()
        .require(CHAIN_ID)?
        .into_chain()
        .ok_or_else(|| Error::ModuleNotFound(CHAIN_ID.into()))?;

    let mut app = factory.build();
    app.use_middleware(authenticate)
        .get("/orders/{id}", get_order)
        .post("/login", login)
        .get("/slow", slow)
        .get("/boom", boom)
        .get("/health", |_req, reply: Reply| async move {
            reply.end()?;
            Ok(())
        });

    let heartbeat = tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err::<(), _>(AppError::new("heartbeat lost").with_code("EHEARTBEAT"))
    });
    process::monitor(Arc::clone(autolog), heartbeat);

    app.listen("0.0.0.0:3000").await
}

// Pretend every caller presenting a bearer token is user 7.
async fn authenticate(req: Request, reply: Reply, next: Next) -> Result<(), AppError> {
    if req.header("authorization").is_some() {
        req.insert_state("user", json!({"id": 7, "email": "ada@example.com"}));
    }
    next.run(req, reply).await;
    Ok(())
}

async fn get_order(req: Request, reply: Reply) -> Result<(), AppError> {
    reply.json(&json!({"id": req.param("id"), "status": "shipped"}))?;
    Ok(())
}

async fn login(req: Request, reply: Reply) -> Result<(), AppError> {
    let body = req.body_value();
    let Some(username) = body.get("username").and_then(|u| u.as_str()) else {
        reply.status(http::StatusCode::BAD_REQUEST);
        return Err(AppError::new("username is required").with_name("ValidationError"));
    };
    reply.json(&json!({"user": username, "token": "t-123"}))?;
    Ok(())
}

async fn slow(_req: Request, reply: Reply) -> Result<(), AppError> {
    tokio::time::sleep(Duration::from_millis(1500)).await;
    reply.send("done")?;
    Ok(())
}

async fn boom(_req: Request, _reply: Reply) -> Result<(), AppError> {
    Err(AppError::new("db timeout").with_code("ETIMEDOUT"))
}
