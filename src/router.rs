//! Radix-tree request router and router groups.
//!
//! One tree per HTTP method, O(path-length) lookup. Routes are registered on
//! a [`RouterGroup`], which carries an ordered middleware list, and the
//! group is mounted onto the [`Router`] handed to
//! [`Application::run`](crate::Application::run).

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{self, BoxedMiddleware, Chain, Middleware};

/// Methods that also answer CORS preflight on the same path.
const PREFLIGHTED: [Method; 6] = [
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Patch,
    Method::Delete,
    Method::Head,
];

// ── Router ────────────────────────────────────────────────────────────────────

/// The application router.
///
/// Build it once at startup from one or more groups.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Arc<Chain>>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Inserts every route of `group`.
    ///
    /// Explicit registrations go in first. An implicit OPTIONS route whose
    /// path is already taken is skipped.
    ///
    /// # Panics
    ///
    /// Panics if an explicit route is invalid or conflicts with one already
    /// mounted.
    pub fn mount(mut self, group: RouterGroup) -> Self {
        let (explicit, implicit): (Vec<_>, Vec<_>) = group.routes.into_iter().partition(|r| !r.implicit);
        for route in explicit {
            self.routes
                .entry(route.method)
                .or_default()
                .insert(&route.path, route.chain)
                .unwrap_or_else(|e| panic!("invalid route `{} {}`: {e}", route.method, route.path));
        }
        for route in implicit {
            if let Err(e) = self.routes.entry(route.method).or_default().insert(&route.path, route.chain) {
                debug!(path = %route.path, error = %e, "preflight route already registered");
            }
        }
        self
    }

    pub(crate) fn lookup(&self, method: Method, path: &str) -> Option<(Arc<Chain>, Vec<(String, String)>)> {
        let tree = self.routes.get(&method)?;
        let matched = tree.at(path).ok()?;
        let chain = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((chain, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

// ── RouterGroup ───────────────────────────────────────────────────────────────

struct PendingRoute {
    method: Method,
    path: String,
    chain: Arc<Chain>,
    implicit: bool,
}

/// Routes sharing one ordered middleware list.
///
/// Each route captures the middleware registered so far; middleware added
/// afterwards only applies to routes registered after it.
///
/// ```rust,no_run
/// # use flow::{Context, Next, Router, RouterGroup};
/// # async fn auth(ctx: Context, next: Next) { next.run().await }
/// # async fn get_user(ctx: Context) {}
/// let api = RouterGroup::new()
///     .middleware(auth)
///     .get("/users/:id", get_user);
/// let router = Router::new().mount(api);
/// ```
pub struct RouterGroup {
    middleware: Vec<BoxedMiddleware>,
    routes: Vec<PendingRoute>,
}

impl RouterGroup {
    /// A group starting with the access log and CORS middleware.
    pub fn new() -> Self {
        let builtin: [BoxedMiddleware; 2] = [Arc::new(middleware::access_log), Arc::new(middleware::cors)];
        Self { middleware: builtin.into(), routes: Vec::new() }
    }

    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Get], path, handler) }
    pub fn head(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Head], path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Post], path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Put], path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Patch], path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Delete], path, handler) }
    pub fn options(self, path: &str, handler: impl Handler) -> Self { self.handle(&[Method::Options], path, handler) }

    /// Registers `handler` for all seven verbs.
    pub fn all(self, path: &str, handler: impl Handler) -> Self { self.handle(&Method::ALL, path, handler) }

    /// Registers `handler` under each of `methods`.
    ///
    /// Paths take `{name}` / `{*rest}` or `:name` / `*rest` segments. Any
    /// method other than OPTIONS also gets an OPTIONS route on the same path
    /// unless `methods` names OPTIONS itself.
    pub fn handle(mut self, methods: &[Method], path: &str, handler: impl Handler) -> Self {
        let path = normalize(path);
        let handler: BoxedHandler = handler.into_boxed_handler();
        let snapshot: Arc<[BoxedMiddleware]> = self.middleware.as_slice().into();
        let chain = Arc::new(Chain::new(snapshot, handler));

        for &method in methods {
            self.routes.push(PendingRoute { method, path: path.clone(), chain: Arc::clone(&chain), implicit: false });
        }
        let preflighted = methods.iter().any(|m| PREFLIGHTED.contains(m));
        if preflighted && !methods.contains(&Method::Options) {
            self.routes.push(PendingRoute { method: Method::Options, path, chain, implicit: true });
        }
        self
    }
}

impl Default for RouterGroup {
    fn default() -> Self { Self::new() }
}

/// Rewrites `:name` and `*rest` segments into the `{name}` / `{*rest}` form.
fn normalize(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*').filter(|n| !n.is_empty()) {
                format!("{{*{name}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::middleware::Next;

    async fn noop(_: Context) {}
    async fn pass(_: Context, next: Next) { next.run().await }

    #[test]
    fn normalizes_colon_and_star_segments() {
        assert_eq!(normalize("/users/:id"), "/users/{id}");
        assert_eq!(normalize("/static/*filepath"), "/static/{*filepath}");
        assert_eq!(normalize("/a/{b}/c"), "/a/{b}/c");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn lookup_returns_params_in_path_order() {
        let router = Router::new().mount(RouterGroup::new().get("/x/:a/:b", noop));
        let (_, params) = router.lookup(Method::Get, "/x/1/2").unwrap();
        assert_eq!(params, vec![("a".to_owned(), "1".to_owned()), ("b".to_owned(), "2".to_owned())]);
        assert!(router.lookup(Method::Post, "/x/1/2").is_none());
        assert!(router.lookup(Method::Get, "/x/1").is_none());
    }

    #[test]
    fn preflight_is_registered_alongside() {
        let router = Router::new().mount(RouterGroup::new().post("/items", noop).head("/items", noop));
        assert!(router.lookup(Method::Options, "/items").is_some());
    }

    #[test]
    fn all_registers_every_verb() {
        let router = Router::new().mount(RouterGroup::new().all("/any", noop));
        for method in Method::ALL {
            assert!(router.lookup(method, "/any").is_some(), "{method}");
        }
    }

    #[test]
    fn explicit_options_wins_over_implicit() {
        let group = RouterGroup::new()
            .get("/p", noop)
            .middleware(pass)
            .options("/p", noop);
        let router = Router::new().mount(group);
        let (chain, _) = router.lookup(Method::Options, "/p").unwrap();
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn routes_snapshot_middleware_at_registration() {
        let group = RouterGroup::new()
            .get("/before", noop)
            .middleware(pass)
            .get("/after", noop);
        let router = Router::new().mount(group);
        assert_eq!(router.lookup(Method::Get, "/before").unwrap().0.len(), 2);
        assert_eq!(router.lookup(Method::Get, "/after").unwrap().0.len(), 3);
    }

    #[test]
    #[should_panic(expected = "invalid route")]
    fn conflicting_routes_panic() {
        let _ = Router::new()
            .mount(RouterGroup::new().get("/dup", noop))
            .mount(RouterGroup::new().get("/dup", noop));
    }
}
