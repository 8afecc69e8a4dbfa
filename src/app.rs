//! The application handle.
//!
//! Everything shared across requests lives here: configuration, the
//! request-id source, view templates, collaborator clients, the recovery
//! hooks and the task and timer registries. [`Application`] is a cheap
//! clone of one `Arc`; every [`Context`](crate::Context) carries one.

use std::any::Any;
use std::sync::Arc;

use http::request::Parts;
use minijinja::Environment;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::http_client::HttpClient;
use crate::jwt::Jwt;
use crate::logging;
use crate::orm::Orm;
use crate::recover::{self, NotFoundHandler, PanicHandler};
use crate::redis_client::RedisClient;
use crate::request_id::RequestIds;
use crate::response::ResponseBody;
use crate::router::Router;
use crate::server::{Server, Service};
use crate::task::AsyncTaskRegistry;
use crate::timer::TimerRegistry;

#[derive(Clone)]
pub struct Application {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    ids: RequestIds,
    views: Environment<'static>,
    jwt: Jwt,
    http_client: HttpClient,
    redis: Option<RedisClient>,
    orm: Option<Orm>,
    panic_handler: PanicHandler,
    not_found: NotFoundHandler,
    async_tasks: AsyncTaskRegistry,
    timers: TimerRegistry,
}

impl Application {
    /// An application with the default recovery hooks.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ApplicationBuilder {
        ApplicationBuilder {
            config,
            panic_handler: Arc::new(recover::default_panic_handler),
            not_found: Arc::new(recover::default_not_found),
        }
    }

    pub fn config(&self) -> &Config { &self.inner.config }

    /// Strictly increasing, starting at 1.
    pub fn next_request_id(&self) -> i64 { self.inner.ids.next() }

    pub(crate) fn views(&self) -> &Environment<'static> { &self.inner.views }
    pub(crate) fn panic_handler(&self) -> &PanicHandler { &self.inner.panic_handler }
    pub(crate) fn not_found_handler(&self) -> &NotFoundHandler { &self.inner.not_found }
    pub(crate) fn async_tasks(&self) -> &AsyncTaskRegistry { &self.inner.async_tasks }
    pub(crate) fn timers(&self) -> &TimerRegistry { &self.inner.timers }

    pub fn jwt(&self) -> &Jwt { &self.inner.jwt }
    pub fn http_client(&self) -> &HttpClient { &self.inner.http_client }

    /// # Panics
    ///
    /// Panics if redis is not enabled in the configuration.
    pub fn redis(&self) -> &RedisClient {
        match &self.inner.redis {
            Some(redis) => redis,
            None => panic!("redis is not enabled"),
        }
    }

    /// # Panics
    ///
    /// Panics if the ORM is not enabled in the configuration.
    pub fn orm(&self) -> &Orm {
        match &self.inner.orm {
            Some(orm) => orm,
            None => panic!("orm is not enabled"),
        }
    }

    /// Initialises logging, binds `host:port` and serves `router` until
    /// SIGTERM or Ctrl-C.
    pub async fn run(self, router: Router) -> Result<()> {
        let config = self.config();
        let _guard = logging::init(&config.server.app_name, &config.logger)?;
        info!(
            app_name = %config.server.app_name,
            proxy = config.server.proxy,
            host = %config.server.host,
            port = config.server.port,
            static_path = %config.server.static_path,
            view_path = %config.server.view_path,
            log_path = %config.logger.path,
            log_level = %config.logger.level,
            redis = config.redis.enable,
            orm = config.orm.enable,
            "start params"
        );

        let server = Server::bind(&config.server.host, config.server.port).await?;
        server.serve(Service::new(self.clone(), router)).await
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Configures the recovery hooks before the application is built.
pub struct ApplicationBuilder {
    config: Config,
    panic_handler: PanicHandler,
    not_found: NotFoundHandler,
}

impl ApplicationBuilder {
    /// Replaces the default 500 hook.
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Parts, Box<dyn Any + Send>) -> http::Response<ResponseBody> + Send + Sync + 'static,
    {
        self.panic_handler = Arc::new(handler);
        self
    }

    /// Replaces the default 404 hook.
    pub fn not_found<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Parts) -> http::Response<ResponseBody> + Send + Sync + 'static,
    {
        self.not_found = Arc::new(handler);
        self
    }

    /// Validates the configuration and constructs the collaborators.
    ///
    /// Must run inside a tokio runtime when the ORM is enabled.
    pub fn build(self) -> Result<Application> {
        let config = self.config;
        config.validate()?;
        recover::install_backtrace_hook();

        let mut views = Environment::new();
        views.set_loader(minijinja::path_loader(&config.server.view_path));

        let jwt = Jwt::new(&config.jwt);
        let http_client = HttpClient::new(&config.http_client)?;
        let redis = config.redis.enable.then(|| RedisClient::new(&config.redis)).transpose()?;
        let orm = config.orm.enable.then(|| Orm::new(&config.orm)).transpose()?;

        Ok(Application {
            inner: Arc::new(Inner {
                config,
                ids: RequestIds::new(),
                views,
                jwt,
                http_client,
                redis,
                orm,
                panic_handler: self.panic_handler,
                not_found: self.not_found,
                async_tasks: AsyncTaskRegistry::default(),
                timers: TimerRegistry::default(),
            }),
        })
    }
}
