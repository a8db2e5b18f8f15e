//! # tsu-autolog
//!
//! Automatic request and error logging for tsu HTTP apps.
//!
//! Configure a sink once at startup. Every app built afterwards reports one
//! structured event per request (timing, status, caller identity, redacted
//! payloads and any error the handler raised) without a single logging call
//! in your handlers.
//!
//! ## Pieces
//!
//! - Two HTTP frameworks to instrument:
//!   - [`chain`]: a middleware stack whose handlers emit responses through a
//!     [`Reply`](chain::Reply).
//!   - [`lifecycle`]: routes that return responses, plus declarative
//!     `onRequest` / `onError` / `onResponse` hooks.
//! - The engine, [`instrument`]: the [`Autolog`] controller, the module
//!   loader hook, per-framework adapters, redaction, severity classification
//!   and sinks.
//! - [`Server`]: hyper-based serving with graceful shutdown for either app.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsu_autolog::instrument::{self, Autolog, Options, TracingSink};
//! use tsu_autolog::instrument::loader::{LIFECYCLE_ID, ModuleLoader};
//! use tsu_autolog::{AppError, Request, Response};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tsu_autolog::Error> {
//!     tracing_subscriber::fmt::init();
//!
//!     instrument::install();
//!     Autolog::global().configure(Arc::new(TracingSink), Options::from_env());
//!
//!     let factory = ModuleLoader::global()
//!         .require(LIFECYCLE_ID)?
//!         .into_lifecycle()
//!         .ok_or_else(|| tsu_autolog::Error::ModuleNotFound(LIFECYCLE_ID.into()))?;
//!
//!     let mut app = factory.build();
//!     app.get("/orders/{id}", get_order);
//!     app.listen("0.0.0.0:3000").await
//! }
//!
//! async fn get_order(req: Request) -> Result<Response, AppError> {
//!     let id = req.param("id").unwrap_or_default();
//!     Ok(Response::json(serde_json::to_vec(&serde_json::json!({ "id": id }))?))
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod chain;
pub mod instrument;
pub mod lifecycle;

pub use error::{AppError, Error};
pub use handler::{BoxFuture, Handler};
pub use instrument::{Autolog, install};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use server::{Server, Service};
