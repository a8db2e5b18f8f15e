//! The instrumentation engine.
//!
//! [`Autolog`] holds the active [`Sink`] and the live [`Config`]. Adapters are
//! handed an `Arc<Autolog>` when they are attached and read both on every
//! request, so `configure` and `update_config` take effect for apps that are
//! already running.
//!
//! Two ways in:
//!
//! - **interception**: [`install`] the controller into a [`ModuleLoader`];
//!   every framework resolved after a sink is configured comes back wrapped.
//! - **opt-in**: wrap a factory or instrument an app yourself with
//!   [`Autolog::wrap_chain`], [`Autolog::instrument_lifecycle`] and friends.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsu_autolog::instrument::{self, Autolog, Options, TracingSink};
//! use tsu_autolog::instrument::loader::{CHAIN_ID, ModuleLoader};
//!
//! # async fn run() -> Result<(), tsu_autolog::Error> {
//! instrument::install();
//! Autolog::global().configure(Arc::new(TracingSink), Options::new().slow_request_threshold_ms(500));
//!
//! let Some(factory) = ModuleLoader::global().require(CHAIN_ID)?.into_chain() else {
//!     unreachable!()
//! };
//! let mut app = factory.build();
//! app.get("/orders", |_req, reply: tsu_autolog::chain::Reply| async move {
//!     reply.json(&serde_json::json!([]))?;
//!     Ok(())
//! });
//! app.listen("0.0.0.0:3000").await
//! # }
//! ```

pub mod adapter;
pub mod chain;
pub mod classify;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod loader;
pub mod payload;
pub mod process;
pub mod redact;
pub mod sink;
pub mod trace;

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::chain::App;
use crate::lifecycle::Instance;

use adapter::Adapter;
use chain::ChainAdapter;
use lifecycle::LifecycleAdapter;
use loader::{Factory, LoaderHook, Module, ModuleLoader};

pub use config::{Config, Options};
pub use event::{ErrorDetails, Level, LogEvent, RequestRecord};
pub use payload::{CanonicalRequest, default_build_request_payload};
pub use redact::{REDACTED, RedactFields, redact};
pub use sink::{ChannelSink, MemorySink, Sink, TracingSink};

/// The instrumentation controller.
pub struct Autolog {
    sink: RwLock<Option<Arc<dyn Sink>>>,
    config: RwLock<Arc<Config>>,
    installed: AtomicBool,
    next_adapter: AtomicU64,
}

impl Autolog {
    /// A fresh, inactive controller with the default config.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sink: RwLock::new(None),
            config: RwLock::new(Arc::new(Config::default())),
            installed: AtomicBool::new(false),
            next_adapter: AtomicU64::new(1),
        })
    }

    /// The process-wide controller.
    pub fn global() -> &'static Arc<Autolog> {
        static GLOBAL: OnceLock<Arc<Autolog>> = OnceLock::new();
        GLOBAL.get_or_init(Autolog::new)
    }

    /// Sets the active sink, replacing any previous one, and merges `options`.
    pub fn configure(&self, sink: Arc<dyn Sink>, options: Options) {
        *self.sink.write() = Some(sink);
        self.update_config(options);
        info!("instrumentation configured");
    }

    /// Merges `options` into the config, leaving the sink alone.
    pub fn update_config(&self, options: Options) {
        let mut config = self.config.write();
        *config = Arc::new((**config).clone().merge(options));
        debug!(config = ?**config, "config updated");
    }

    /// Snapshot of the current config.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    pub fn sink(&self) -> Option<Arc<dyn Sink>> {
        self.sink.read().clone()
    }

    /// Whether a sink is set. Until then instrumentation does nothing.
    pub fn is_active(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Installs the interception hook into `loader`. Only the first call per
    /// controller has any effect; returns whether this one did.
    pub fn install(self: &Arc<Self>, loader: &ModuleLoader) -> bool {
        if self.installed.swap(true, Ordering::AcqRel) {
            debug!("instrumentation hook already installed");
            return false;
        }
        loader.add_hook(Arc::new(InstrumentHook { autolog: Arc::clone(self) }));
        info!("instrumentation hook installed");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// A factory whose apps come out instrumented.
    pub fn wrap_chain(self: &Arc<Self>, factory: &Factory<App>) -> Factory<App> {
        let adapter = ChainAdapter::new(Arc::clone(self));
        factory.instrument_with(move |app| attach(&adapter, app))
    }

    pub fn wrap_lifecycle(self: &Arc<Self>, factory: &Factory<Instance>) -> Factory<Instance> {
        let adapter = LifecycleAdapter::new(Arc::clone(self));
        factory.instrument_with(move |instance| attach(&adapter, instance))
    }

    /// Instruments an app built without the loader. Call it before
    /// registering middleware or routes.
    pub fn instrument_chain(self: &Arc<Self>, app: &mut App) {
        attach(&ChainAdapter::new(Arc::clone(self)), app);
    }

    pub fn instrument_lifecycle(self: &Arc<Self>, instance: &mut Instance) {
        attach(&LifecycleAdapter::new(Arc::clone(self)), instance);
    }

    pub(crate) fn next_adapter_id(&self) -> u64 {
        self.next_adapter.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Autolog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autolog")
            .field("active", &self.is_active())
            .field("installed", &self.is_installed())
            .field("config", &*self.config())
            .finish()
    }
}

/// Installs the global controller into the global loader.
///
/// Run it before the first framework is loaded; frameworks resolved earlier
/// stay uninstrumented.
pub fn install() -> bool {
    Autolog::global().install(ModuleLoader::global())
}

struct InstrumentHook {
    autolog: Arc<Autolog>,
}

impl LoaderHook for InstrumentHook {
    fn on_load(&self, id: &str, module: Module) -> Module {
        if !self.autolog.is_active() {
            return module;
        }
        match module {
            Module::Chain(factory) => {
                debug!(id, "wrapping chain framework");
                Module::Chain(self.autolog.wrap_chain(&factory))
            }
            Module::Lifecycle(factory) => {
                debug!(id, "wrapping lifecycle framework");
                Module::Lifecycle(self.autolog.wrap_lifecycle(&factory))
            }
            other => other,
        }
    }
}

fn attach<A: Adapter>(adapter: &Arc<A>, target: &mut A::Target) {
    contain("adapter attach", || Arc::clone(adapter).attach(target));
}

thread_local! {
    static CONTAINING: Cell<usize> = const { Cell::new(0) };
}

/// Runs `f`, turning a panic into a logged diagnostic.
pub(crate) fn contain<T>(what: &str, f: impl FnOnce() -> T) -> Option<T> {
    CONTAINING.with(|depth| depth.set(depth.get() + 1));
    let outcome = catch_unwind(AssertUnwindSafe(f));
    CONTAINING.with(|depth| depth.set(depth.get() - 1));

    match outcome {
        Ok(value) => Some(value),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!("instrumentation failure in {what}: {reason}");
            None
        }
    }
}

pub(crate) fn is_containing() -> bool {
    CONTAINING.with(|depth| depth.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    use crate::request::Request;

    fn get(path: &str) -> Request {
        Request::from_http(http::Request::get(path).body(Bytes::new()).unwrap())
    }

    #[test]
    fn configure_merges_and_replaces_sink() {
        let autolog = Autolog::new();
        assert!(!autolog.is_active());

        autolog.configure(Arc::new(MemorySink::new()), Options::new().slow_request_threshold_ms(10));
        let second = Arc::new(MemorySink::new());
        autolog.configure(second.clone(), Options::new().ignore_paths(["/ping"]));

        let config = autolog.config();
        assert_eq!(config.slow_request_threshold_ms, 10);
        assert_eq!(config.ignore_paths, ["/ping"]);
        let active = autolog.sink().unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&active), Arc::as_ptr(&second)));
    }

    #[test]
    fn contained_panics_are_swallowed() {
        assert_eq!(contain("test", || 1), Some(1));
        assert_eq!(contain("test", || -> u8 { panic!("nope") }), None);
        assert!(!is_containing());
    }

    #[tokio::test]
    async fn failing_sink_does_not_affect_the_response() {
        struct Broken;
        impl Sink for Broken {
            fn critical(&self, _: LogEvent) { panic!("sink down") }
            fn error(&self, _: LogEvent) { panic!("sink down") }
            fn warning(&self, _: LogEvent) { panic!("sink down") }
            fn info(&self, _: LogEvent) { panic!("sink down") }
        }

        let autolog = Autolog::new();
        autolog.configure(Arc::new(Broken), Options::new());
        let mut instance = Instance::new();
        autolog.instrument_lifecycle(&mut instance);
        instance.get("/ok", |_req: Request| async move { Ok::<_, crate::error::AppError>(json!({"ok": true})) });

        let res = instance.inject(get("/ok")).await;
        assert_eq!(res.body_value(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn config_changes_reach_running_apps() {
        let sink = Arc::new(MemorySink::new());
        let autolog = Autolog::new();
        autolog.configure(sink.clone(), Options::new());
        let mut instance = Instance::new();
        autolog.instrument_lifecycle(&mut instance);
        instance.get("/orders", |_req: Request| async move { Ok::<_, crate::error::AppError>("ok") });

        instance.inject(get("/orders")).await;
        autolog.update_config(Options::new().ignore_paths(["/orders"]));
        instance.inject(get("/orders")).await;

        assert_eq!(sink.len(), 1);
    }
}
