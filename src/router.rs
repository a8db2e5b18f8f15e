//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. Both app flavours use it:
//! the lifecycle [`Instance`](crate::lifecycle::Instance) stores its handlers
//! here, and every route layer of a chain [`App`](crate::chain::App) owns a
//! one-entry router to match and extract params.

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;

/// Method + path routing table over any cloneable value `H`.
pub struct Router<H> {
    routes: HashMap<Method, MatchitRouter<H>>,
}

impl<H: Clone> Router<H> {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register `value` for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; catch-alls use `{*rest}`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid or conflicting route. Routes are registered at
    /// startup, so a bad one is a programming error.
    pub fn insert(&mut self, method: Method, path: &str, value: H) {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, value)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<(H, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((matched.value.clone(), params))
    }
}

impl<H: Clone> Default for Router<H> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_extracts_params_per_method() {
        let mut router = Router::new();
        router.insert(Method::GET, "/users/{id}", "get");
        router.insert(Method::DELETE, "/users/{id}", "delete");

        let (value, params) = router.lookup(&Method::GET, "/users/42").unwrap();
        assert_eq!(value, "get");
        assert_eq!(params.get("id").map(String::as_str), Some("42"));

        assert!(router.lookup(&Method::POST, "/users/42").is_none());
        assert!(router.lookup(&Method::GET, "/orders").is_none());
    }
}
