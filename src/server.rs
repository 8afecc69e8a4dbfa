//! HTTP server, request dispatch and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. Immediately stops `listener.accept()`, so no new connections are made.
//! 2. Tells every open connection to shut down: idle keep-alive connections
//!    close at once, busy ones after their in-flight request.
//! 3. Waits up to the drain timeout for them, aborts any stragglers and
//!    returns from [`Server::serve`].

use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, warn};

use crate::app::Application;
use crate::context::Context;
use crate::error::Result;
use crate::method::Method;
use crate::middleware::Next;
use crate::response::ResponseBody;
use crate::router::Router;

// ── Service ───────────────────────────────────────────────────────────────────

/// Routes and runs single requests. Cheap to clone.
///
/// [`Server`] drives one per connection; tests can call
/// [`handle`](Service::handle) directly without a socket.
#[derive(Clone)]
pub struct Service {
    app: Application,
    router: Arc<Router>,
}

impl Service {
    pub fn new(app: Application, router: Router) -> Self {
        Self { app, router: Arc::new(router) }
    }

    /// Routes one request and produces one response.
    ///
    /// No route means the not-found hook. Otherwise a [`Context`] is built
    /// under the next request id and the route's chain runs inside the
    /// request span. A panic anywhere in the chain goes to the panic hook.
    pub async fn handle<B>(&self, req: http::Request<B>, remote_addr: SocketAddr) -> http::Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let matched = Method::try_from(req.method())
            .ok()
            .and_then(|method| self.router.lookup(method, req.uri().path()));
        let Some((chain, path_params)) = matched else {
            let (parts, _) = req.into_parts();
            return (self.app.not_found_handler())(&parts);
        };

        let id = self.app.next_request_id();
        let ctx = Context::new(self.app.clone(), id, req, path_params, remote_addr).await;
        let span = ctx.span().clone();

        let outcome = AssertUnwindSafe(Next::start(ctx.clone(), chain).run())
            .catch_unwind()
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(()) => ctx.take_response(),
            Err(payload) => span.in_scope(|| (self.app.panic_handler())(ctx.request().parts(), payload)),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// How long shutdown waits for open connections by default.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The HTTP server.
pub struct Server {
    listener: TcpListener,
    drain_timeout: Duration,
}

impl Server {
    /// Binds `host:port`.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener, drain_timeout: DRAIN_TIMEOUT }
    }

    /// Caps how long shutdown waits for open connections before aborting them.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until SIGTERM or Ctrl-C, then drains in-flight connections.
    pub async fn serve(self, service: Service) -> Result<()> {
        self.serve_with_shutdown(service, shutdown_signal()).await
    }

    /// Serves until `signal` resolves, then drains in-flight connections.
    pub async fn serve_with_shutdown(self, service: Service, signal: impl Future<Output = ()>) -> Result<()> {
        info!(addr = %self.local_addr()?, "flow listening");

        let builder = ConnBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = signal;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown first: a signal stops accepting even if more
                // connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = self.listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let service = service.clone();
                    let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let service = service.clone();
                        async move { Ok::<_, Infallible>(service.handle(req, remote_addr).await) }
                    });
                    let conn = builder.serve_connection(TokioIo::new(stream), svc).into_owned();
                    let conn = graceful.watch(conn);

                    tasks.spawn(async move {
                        if let Err(e) = conn.await {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(self.drain_timeout, async {
            graceful.shutdown().await;
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(timeout_ms = self.drain_timeout.as_millis() as u64, "drain timed out, aborting open connections");
            tasks.shutdown().await;
        }

        info!("flow stopped");
        Ok(())
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT. Ctrl-C only on Windows.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
