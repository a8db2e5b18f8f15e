//! Process-level failures: panics and background tasks that end in `Err`.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use super::event::{ErrorDetails, Level, LogEvent};
use super::{Autolog, contain, is_containing};
use crate::error::AppError;

pub const UNCAUGHT_EXCEPTION: &str = "Uncaught Exception";
pub const UNHANDLED_REJECTION: &str = "Unhandled Rejection";

/// Reports every panic as a `critical` "Uncaught Exception" event, then runs
/// the previously installed hook.
///
/// Panics raised and contained inside the instrumentation itself are not
/// reported.
pub fn install_panic_hook(autolog: Arc<Autolog>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if !is_containing() {
            report_panic(&autolog, info);
        }
        previous(info);
    }));
}

/// Watches a detached task and reports an `Err` outcome as a `critical`
/// "Unhandled Rejection" event.
///
/// Resolves to the task's value on success and `None` otherwise. Panicked
/// tasks are left to the panic hook.
pub fn monitor<T, E>(autolog: Arc<Autolog>, task: JoinHandle<Result<T, E>>) -> JoinHandle<Option<T>>
where
    T: Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                let err: AppError = e.into();
                send(&autolog, UNHANDLED_REJECTION, ErrorDetails::from(&err));
                None
            }
            Err(e) => {
                debug!("monitored task did not finish: {e}");
                None
            }
        }
    })
}

fn report_panic(autolog: &Autolog, info: &PanicHookInfo<'_>) {
    let message = payload_message(info.payload());
    let location = info.location().map(ToString::to_string).unwrap_or_default();
    let backtrace = Backtrace::capture();
    let stack = match backtrace.status() {
        BacktraceStatus::Captured => format!("at {location}\n{backtrace}"),
        _ => format!("at {location}"),
    };
    let error = ErrorDetails { message, name: "panic".to_owned(), code: None, stack: Some(stack) };
    send(autolog, UNCAUGHT_EXCEPTION, error);
}

fn send(autolog: &Autolog, title: &str, error: ErrorDetails) {
    let Some(sink) = autolog.sink() else { return };
    let event = LogEvent {
        title: title.to_owned(),
        message: error.message.clone(),
        level: Level::Critical,
        request: None,
        error: Some(error),
    };
    contain("process event", || sink.critical(event));
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_owned())
}
