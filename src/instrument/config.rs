//! Instrumentation settings.
//!
//! [`Config`] is the live, process-wide configuration held by the controller.
//! Callers never build one directly; they pass [`Options`], whose set fields
//! are laid over the current config and whose unset fields leave it alone.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use super::adapter::CompletedResponse;
use super::payload::{CanonicalRequest, default_build_request_payload};
use super::redact::RedactFields;

/// Drops an event after timing and status are known.
pub type ShouldIgnore = Arc<dyn Fn(&CanonicalRequest, &CompletedResponse) -> bool + Send + Sync>;
/// Turns a request into the context fields of its event.
pub type BuildRequestPayload = Arc<dyn Fn(&CanonicalRequest) -> Map<String, Value> + Send + Sync>;
/// Contributes extra context fields, overriding the builder's.
pub type ContextHook = Arc<dyn Fn(&CanonicalRequest) -> Option<Map<String, Value>> + Send + Sync>;

pub const DEFAULT_SLOW_REQUEST_THRESHOLD_MS: u64 = 1000;

const ENV_IGNORE_PATHS: &str = "AUTOLOG_IGNORE_PATHS";
const ENV_SLOW_REQUEST_THRESHOLD: &str = "AUTOLOG_SLOW_REQUEST_THRESHOLD_MS";
const ENV_REDACT_FIELDS: &str = "AUTOLOG_REDACT_FIELDS";

#[derive(Clone)]
pub struct Config {
    /// Path prefixes that are never instrumented.
    pub ignore_paths: Vec<String>,
    pub should_ignore: Option<ShouldIgnore>,
    pub slow_request_threshold_ms: u64,
    pub redact_fields: RedactFields,
    pub build_request_payload: BuildRequestPayload,
    pub context_hook: Option<ContextHook>,
}

impl Config {
    /// Lays `options` over `self`. Unset options keep the current value.
    pub fn merge(mut self, options: Options) -> Self {
        let Options {
            ignore_paths,
            should_ignore,
            slow_request_threshold_ms,
            redact_fields,
            build_request_payload,
            context_hook,
        } = options;

        if let Some(paths) = ignore_paths {
            self.ignore_paths = paths;
        }
        if let Some(threshold) = slow_request_threshold_ms {
            self.slow_request_threshold_ms = threshold;
        }
        if let Some(fields) = redact_fields {
            self.redact_fields = fields;
        }
        if let Some(builder) = build_request_payload {
            self.build_request_payload = builder;
        }
        self.should_ignore = should_ignore.or(self.should_ignore);
        self.context_hook = context_hook.or(self.context_hook);
        self
    }

    pub fn is_ignored_path(&self, path: &str) -> bool {
        self.ignore_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_paths: vec!["/health".to_owned(), "/metrics".to_owned()],
            should_ignore: None,
            slow_request_threshold_ms: DEFAULT_SLOW_REQUEST_THRESHOLD_MS,
            redact_fields: RedactFields::default(),
            build_request_payload: Arc::new(default_build_request_payload),
            context_hook: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ignore_paths", &self.ignore_paths)
            .field("should_ignore", &self.should_ignore.is_some())
            .field("slow_request_threshold_ms", &self.slow_request_threshold_ms)
            .field("redact_fields", &self.redact_fields.terms())
            .field("context_hook", &self.context_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// A partial configuration update.
///
/// ```rust
/// use tsu_autolog::instrument::Options;
///
/// let options = Options::new()
///     .ignore_paths(["/health", "/ready"])
///     .slow_request_threshold_ms(250)
///     .redact_fields(["password", "ssn"]);
/// # let _ = options;
/// ```
#[derive(Clone, Default)]
pub struct Options {
    ignore_paths: Option<Vec<String>>,
    should_ignore: Option<ShouldIgnore>,
    slow_request_threshold_ms: Option<u64>,
    redact_fields: Option<RedactFields>,
    build_request_payload: Option<BuildRequestPayload>,
    context_hook: Option<ContextHook>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `AUTOLOG_IGNORE_PATHS`, `AUTOLOG_SLOW_REQUEST_THRESHOLD_MS` and
    /// `AUTOLOG_REDACT_FIELDS` from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Options::from_env), reading through `lookup`.
    ///
    /// Lists are comma-separated; blank entries are dropped. Values that do
    /// not parse are ignored with a warning, leaving the option unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::new();
        if let Some(paths) = lookup(ENV_IGNORE_PATHS) {
            options.ignore_paths = Some(split_list(&paths));
        }
        if let Some(raw) = lookup(ENV_SLOW_REQUEST_THRESHOLD) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => options.slow_request_threshold_ms = Some(ms),
                Err(e) => warn!("ignoring {ENV_SLOW_REQUEST_THRESHOLD}={raw:?}: {e}"),
            }
        }
        if let Some(fields) = lookup(ENV_REDACT_FIELDS) {
            options.redact_fields = Some(RedactFields::new(split_list(&fields)));
        }
        options
    }

    pub fn ignore_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn should_ignore(
        mut self,
        f: impl Fn(&CanonicalRequest, &CompletedResponse) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_ignore = Some(Arc::new(f));
        self
    }

    pub fn slow_request_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_request_threshold_ms = Some(ms);
        self
    }

    pub fn redact_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.redact_fields = Some(RedactFields::new(fields));
        self
    }

    pub fn build_request_payload(
        mut self,
        f: impl Fn(&CanonicalRequest) -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.build_request_payload = Some(Arc::new(f));
        self
    }

    pub fn context_hook(
        mut self,
        f: impl Fn(&CanonicalRequest) -> Option<Map<String, Value>> + Send + Sync + 'static,
    ) -> Self {
        self.context_hook = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("ignore_paths", &self.ignore_paths)
            .field("slow_request_threshold_ms", &self.slow_request_threshold_ms)
            .field("redact_fields", &self.redact_fields)
            .finish_non_exhaustive()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
