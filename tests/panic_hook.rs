use std::panic;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tsu_autolog::instrument::process::{self, UNCAUGHT_EXCEPTION};
use tsu_autolog::instrument::{Autolog, Level, LogEvent, Options, Sink};
use tsu_autolog::lifecycle::Instance;
use tsu_autolog::{AppError, Request};

/// Records critical events; blows up on anything else.
#[derive(Default)]
struct CriticalOnly {
    events: Mutex<Vec<LogEvent>>,
}

impl Sink for CriticalOnly {
    fn critical(&self, event: LogEvent) { self.events.lock().push(event) }
    fn error(&self, _: LogEvent) { panic!("sink rejected error event") }
    fn warning(&self, _: LogEvent) { panic!("sink rejected warning event") }
    fn info(&self, _: LogEvent) { panic!("sink rejected info event") }
}

#[tokio::test]
async fn panics_are_reported_unless_contained() {
    let sink = Arc::new(CriticalOnly::default());
    let autolog = Autolog::new();
    autolog.configure(sink.clone(), Options::new());
    process::install_panic_hook(Arc::clone(&autolog));

    // The info event makes the sink panic inside the instrumentation; that
    // panic is contained and must not surface as an uncaught exception.
    let mut app = Instance::new();
    autolog.instrument_lifecycle(&mut app);
    app.get("/ok", |_req: Request| async move { Ok::<_, AppError>("ok") });
    let res = app
        .inject(Request::from_http(http::Request::get("/ok").body(Bytes::new()).unwrap()))
        .await;
    assert_eq!(res.body(), b"ok");
    assert!(sink.events.lock().is_empty());

    let outcome = panic::catch_unwind(|| {
        panic!("worker crashed");
    });
    assert!(outcome.is_err());

    let events = std::mem::take(&mut *sink.events.lock());
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.title, UNCAUGHT_EXCEPTION);
    assert_eq!(event.level, Level::Critical);
    assert_eq!(event.message, "worker crashed");
    assert!(event.request.is_none());
    let stack = event.error.as_ref().and_then(|e| e.stack.as_deref()).unwrap();
    assert!(stack.starts_with("at tests/panic_hook.rs"), "unexpected stack: {stack}");
}
