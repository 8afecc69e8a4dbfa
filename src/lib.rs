//! # flow
//!
//! A small HTTP application framework on hyper: Koa-style middleware around
//! context-taking handlers, a request/response API with freshness and
//! download handling, merged request parameters, and background task and
//! timer scheduling.
//!
//! ## The pipeline
//!
//! ```text
//! router match → Context (id, request, params, span) → middleware… → handler
//!      │                                                          │
//!      └─ no route: not-found hook          panic anywhere: panic hook (500)
//! ```
//!
//! Every [`RouterGroup`] starts with an access log and a CORS middleware.
//! Middleware decides if and when the rest of the chain runs by awaiting
//! [`Next::run`]; code after the await sees the handler's response state.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use flow::{Application, Config, Context, Next, Router, RouterGroup};
//!
//! #[tokio::main]
//! async fn main() -> flow::Result<()> {
//!     let app = Application::new(Config::default())?;
//!     let api = RouterGroup::new()
//!         .middleware(timing)
//!         .get("/users/:id", get_user);
//!
//!     app.run(Router::new().mount(api)).await
//! }
//!
//! async fn timing(ctx: Context, next: Next) {
//!     next.run().await;
//!     tracing::info!(status = ctx.status_code(), "handled");
//! }
//!
//! async fn get_user(ctx: Context) {
//!     let id = ctx.int64_param("id");
//!     ctx.json(&serde_json::json!({ "id": id }));
//! }
//! ```

mod app;
mod config;
mod context;
mod error;
mod handler;
mod http_client;
mod jwt;
mod method;
mod orm;
mod params;
mod redis_client;
mod request;
mod request_id;
mod response;
mod router;
mod server;
mod task;
mod timer;

pub mod logging;
pub mod middleware;
pub mod recover;

pub use app::{Application, ApplicationBuilder};
pub use config::{
    Config, CorsConfig, HttpClientConfig, JwtConfig, LoggerConfig, OrmConfig, OrmPool, RedisConfig,
    ServerConfig,
};
pub use context::Context;
pub use error::{Error, Result};
pub use handler::{BoxFuture, Handler};
pub use http_client::{HttpClient, HttpResult};
pub use jwt::Jwt;
pub use method::Method;
pub use middleware::{Middleware, Next};
pub use orm::Orm;
pub use params::{Bind, FileHeader, FromParam, Params};
pub use redis_client::{RedisClient, RedisResult};
pub use request::Request;
pub use request_id::RequestIds;
pub use response::{ContentType, ResponseBody, plain_text};
pub use router::{Router, RouterGroup};
pub use server::{Server, Service};
pub use task::{AsyncTask, Cancellation, Task, TaskResult};
pub use timer::Timer;
