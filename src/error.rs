//! Error types.
//!
//! Two families, kept apart on purpose:
//!
//! - [`Error`] — infrastructure failures: binding a port, accepting a
//!   connection, replying twice, resolving an unknown module.
//! - [`AppError`] — errors raised by *your* handlers. They travel through the
//!   framework's error path (error middleware, `onError` hooks) and end up in
//!   the request's log event.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use http::StatusCode;

/// The error type returned by tsu's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("response already sent")]
    ResponseAlreadySent,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot find module `{0}`")]
    ModuleNotFound(String),
}

/// An error raised by a route handler or middleware.
///
/// Any `std::error::Error` converts into an `AppError` with `?`, so handlers
/// can bubble up whatever their dependencies return:
///
/// ```rust,ignore
/// async fn get_order(req: Request) -> Result<Response, AppError> {
///     let order = db.find(req.param("id")).await?;
///     Ok(Response::json(serde_json::to_vec(&order)?))
/// }
/// ```
///
/// `AppError` itself does not implement `std::error::Error`; that is what
/// makes the blanket `From` impl coherent.
#[derive(Debug)]
pub struct AppError {
    message: String,
    name: String,
    code: Option<String>,
    status: Option<StatusCode>,
    stack: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: "Error".to_owned(),
            code: None,
            status: None,
            stack: capture_stack(),
            source: None,
        }
    }

    /// Sets the error name (the equivalent of an exception class name).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets a machine-readable error code, e.g. `"ETIMEDOUT"`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the HTTP status the framework should reply with.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn name(&self) -> &str { &self.name }
    pub fn code(&self) -> Option<&str> { self.code.as_deref() }
    pub fn status(&self) -> Option<StatusCode> { self.status }
    pub fn stack(&self) -> Option<&str> { self.stack.as_deref() }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E> From<E> for AppError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_owned();
        Self {
            message: err.to_string(),
            name,
            code: None,
            status: None,
            stack: capture_stack(),
            source: Some(Box::new(err)),
        }
    }
}

/// Captures a backtrace when `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` ask for one.
fn capture_stack() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}
