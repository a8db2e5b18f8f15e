//! Where events go.
//!
//! A [`Sink`] is the logging client: four infallible methods, one per level.
//! Calls happen on the request path, so implementations should hand the event
//! off rather than do I/O inline; [`ChannelSink`] does exactly that.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::event::{Level, LogEvent};

pub trait Sink: Send + Sync + 'static {
    fn critical(&self, event: LogEvent);
    fn error(&self, event: LogEvent);
    fn warning(&self, event: LogEvent);
    fn info(&self, event: LogEvent);

    /// Routes `event` to the method matching its level.
    fn emit(&self, event: LogEvent) {
        match event.level {
            Level::Critical => self.critical(event),
            Level::Error => self.error(event),
            Level::Warning => self.warning(event),
            Level::Info => self.info(event),
        }
    }
}

/// Writes events through `tracing`, as JSON under the `tsu_autolog::event`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn critical(&self, event: LogEvent) {
        error!(target: "tsu_autolog::event", critical = true, title = %event.title, "{}", event.to_value());
    }

    fn error(&self, event: LogEvent) {
        error!(target: "tsu_autolog::event", title = %event.title, "{}", event.to_value());
    }

    fn warning(&self, event: LogEvent) {
        warn!(target: "tsu_autolog::event", title = %event.title, "{}", event.to_value());
    }

    fn info(&self, event: LogEvent) {
        info!(target: "tsu_autolog::event", title = %event.title, "{}", event.to_value());
    }
}

/// Hands events to an async consumer over an unbounded channel.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tsu_autolog::instrument::{Autolog, ChannelSink, Options};
///
/// # async fn run() {
/// let (sink, mut events) = ChannelSink::new();
/// Autolog::global().configure(Arc::new(sink), Options::new());
/// tokio::spawn(async move {
///     while let Some(event) = events.recv().await {
///         // ship it
///         # let _ = event;
///     }
/// });
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: LogEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(title = %e.0.title, "event dropped: receiver closed");
        }
    }
}

impl Sink for ChannelSink {
    fn critical(&self, event: LogEvent) { self.forward(event) }
    fn error(&self, event: LogEvent) { self.forward(event) }
    fn warning(&self, event: LogEvent) { self.forward(event) }
    fn info(&self, event: LogEvent) { self.forward(event) }
}

/// Keeps every event in memory. Meant for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the collected events.
    pub fn take(&self) -> Vec<LogEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: LogEvent, level: Level) {
        debug_assert_eq!(event.level, level, "event routed to the wrong level");
        self.events.lock().push(event);
    }
}

impl Sink for MemorySink {
    fn critical(&self, event: LogEvent) { self.push(event, Level::Critical) }
    fn error(&self, event: LogEvent) { self.push(event, Level::Error) }
    fn warning(&self, event: LogEvent) { self.push(event, Level::Warning) }
    fn info(&self, event: LogEvent) { self.push(event, Level::Info) }
}
