//! Load-time interception of framework modules.
//!
//! Hosts obtain their framework through a [`ModuleLoader`] instead of calling
//! `App::new` directly:
//!
//! ```rust
//! use tsu_autolog::instrument::loader::{CHAIN_ID, ModuleLoader};
//!
//! let factory = ModuleLoader::global()
//!     .require(CHAIN_ID)?
//!     .into_chain()
//!     .expect("built-in chain module");
//! let app = factory.build();
//! # let _ = app;
//! # Ok::<(), tsu_autolog::Error>(())
//! ```
//!
//! Every resolution is passed through the installed [`LoaderHook`]s, which may
//! swap the module for a wrapped one. A [`Factory`] remembers the first
//! wrapper made from it, so loading the same framework again hands back that
//! same wrapper rather than wrapping twice.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::chain::App;
use crate::error::Error;
use crate::lifecycle::Instance;

/// Module identifier of the chain framework.
pub const CHAIN_ID: &str = "tsu::chain";
/// Module identifier of the lifecycle framework.
pub const LIFECYCLE_ID: &str = "tsu::lifecycle";

type Build<A> = Arc<dyn Fn() -> A + Send + Sync>;

/// A framework's application constructor. Cheap to clone.
pub struct Factory<A> {
    inner: Arc<FactoryInner<A>>,
}

struct FactoryInner<A> {
    build: Build<A>,
    /// Set on the original once it has been instrumented.
    wrapped: OnceLock<Factory<A>>,
    is_wrapper: bool,
}

impl<A: 'static> Factory<A> {
    pub fn new(build: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_build(Arc::new(build), false)
    }

    fn from_build(build: Build<A>, is_wrapper: bool) -> Self {
        Self { inner: Arc::new(FactoryInner { build, wrapped: OnceLock::new(), is_wrapper }) }
    }

    /// Builds a fresh application.
    pub fn build(&self) -> A {
        (self.inner.build)()
    }

    /// Whether both handles refer to the same factory.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this factory is a wrapper, or already has one.
    pub fn is_instrumented(&self) -> bool {
        self.inner.is_wrapper || self.inner.wrapped.get().is_some()
    }

    /// Returns a factory whose apps pass through `decorate` after being built.
    ///
    /// Only the first call on a factory uses its `decorate`; later calls
    /// return the same wrapper. Called on a wrapper, returns the wrapper.
    pub fn instrument_with(&self, decorate: impl Fn(&mut A) + Send + Sync + 'static) -> Factory<A> {
        if self.inner.is_wrapper {
            return self.clone();
        }
        self.inner
            .wrapped
            .get_or_init(|| {
                let build = Arc::clone(&self.inner.build);
                Factory::from_build(
                    Arc::new(move || {
                        let mut app = build();
                        decorate(&mut app);
                        app
                    }),
                    true,
                )
            })
            .clone()
    }
}

impl<A> Clone for Factory<A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<A> fmt::Debug for Factory<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("is_wrapper", &self.inner.is_wrapper)
            .field("wrapped", &self.inner.wrapped.get().is_some())
            .finish()
    }
}

/// A resolved module.
#[derive(Clone)]
pub enum Module {
    Chain(Factory<App>),
    Lifecycle(Factory<Instance>),
    /// Anything else a host registers; hooks pass it through.
    Other(Arc<dyn Any + Send + Sync>),
}

impl Module {
    pub fn into_chain(self) -> Option<Factory<App>> {
        match self {
            Self::Chain(factory) => Some(factory),
            _ => None,
        }
    }

    pub fn into_lifecycle(self) -> Option<Factory<Instance>> {
        match self {
            Self::Lifecycle(factory) => Some(factory),
            _ => None,
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chain(factory) => f.debug_tuple("Chain").field(factory).finish(),
            Self::Lifecycle(factory) => f.debug_tuple("Lifecycle").field(factory).finish(),
            Self::Other(_) => f.write_str("Other(..)"),
        }
    }
}

/// Transforms modules as they are resolved.
pub trait LoaderHook: Send + Sync + 'static {
    fn on_load(&self, id: &str, module: Module) -> Module;
}

/// A registry of named modules with load-time hooks.
pub struct ModuleLoader {
    modules: RwLock<HashMap<String, Module>>,
    hooks: RwLock<Vec<Arc<dyn LoaderHook>>>,
}

impl ModuleLoader {
    /// A loader providing the two built-in frameworks.
    pub fn new() -> Self {
        let loader = Self::empty();
        loader.provide(CHAIN_ID, Module::Chain(App::factory()));
        loader.provide(LIFECYCLE_ID, Module::Lifecycle(Instance::factory()));
        loader
    }

    pub fn empty() -> Self {
        Self { modules: RwLock::new(HashMap::new()), hooks: RwLock::new(Vec::new()) }
    }

    /// The process-wide loader.
    pub fn global() -> &'static ModuleLoader {
        static GLOBAL: OnceLock<ModuleLoader> = OnceLock::new();
        GLOBAL.get_or_init(ModuleLoader::new)
    }

    /// Registers `module` under `id`, replacing any previous one.
    pub fn provide(&self, id: impl Into<String>, module: Module) {
        self.modules.write().insert(id.into(), module);
    }

    pub fn add_hook(&self, hook: Arc<dyn LoaderHook>) {
        self.hooks.write().push(hook);
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// Resolves `id`, passing the module through every hook in order.
    pub fn require(&self, id: &str) -> Result<Module, Error> {
        let module = self
            .modules
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound(id.to_owned()))?;
        let hooks = self.hooks.read().clone();
        debug!(id, hooks = hooks.len(), "module resolved");
        Ok(hooks.iter().fold(module, |module, hook| hook.on_load(id, module)))
    }
}

impl Default for ModuleLoader {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.modules.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("ModuleLoader")
            .field("modules", &ids)
            .field("hooks", &self.hook_count())
            .finish()
    }
}
