//! Middleware layer.
//!
//! A middleware is any `async fn(Context, Next)`. It runs before the
//! handler, decides whether and when to continue with `next.run().await`,
//! and can inspect the response state afterwards. Not calling `next`
//! short-circuits everything downstream, handler included.
//!
//! Every [`RouterGroup`](crate::RouterGroup) starts with the two built-ins,
//! [`access_log`] then [`cors`], ahead of anything registered on it.

mod access_log;
mod cors;

pub use access_log::access_log;
pub use cors::cors;

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::handler::{BoxFuture, BoxedHandler};

/// Implemented for every function shaped like `async fn(Context, Next)`.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(self(ctx, next))
    }
}

pub type BoxedMiddleware = Arc<dyn Middleware>;

/// A route's middleware snapshot followed by its handler.
pub(crate) struct Chain {
    middleware: Arc<[BoxedMiddleware]>,
    handler: BoxedHandler,
}

impl Chain {
    pub(crate) fn new(middleware: Arc<[BoxedMiddleware]>, handler: BoxedHandler) -> Self {
        Self { middleware, handler }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.middleware.len()
    }
}

/// The rest of the chain after the current middleware.
///
/// Running it again runs everything downstream again.
#[derive(Clone)]
pub struct Next {
    ctx: Context,
    chain: Arc<Chain>,
    index: usize,
}

impl Next {
    /// The whole chain, first middleware included.
    pub(crate) fn start(ctx: Context, chain: Arc<Chain>) -> Self {
        Self { ctx, chain, index: 0 }
    }

    pub fn run(&self) -> BoxFuture {
        match self.chain.middleware.get(self.index) {
            Some(middleware) => {
                let next = Next { ctx: self.ctx.clone(), chain: Arc::clone(&self.chain), index: self.index + 1 };
                middleware.call(self.ctx.clone(), next)
            }
            None => self.chain.handler.call(self.ctx.clone()),
        }
    }
}
