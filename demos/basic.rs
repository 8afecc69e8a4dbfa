//! A small flow service: JSON endpoints, a JWT-guarded group, a download,
//! a de-duplicated background refresh and a heartbeat timer.
//!
//! Run with:
//!   cargo run --example basic [config.toml]
//!
//! Try:
//!   curl http://localhost:9505/users/42
//!   curl -X POST http://localhost:9505/login -d 'name=alice'
//!   curl http://localhost:9505/me -H "authorization: <token>"
//!   curl -X POST http://localhost:9505/refresh

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flow::{
    Application, AsyncTask, Bind, Cancellation, Config, Context, Next, Router, RouterGroup, Task,
    TaskResult, Timer,
};
use serde::Deserialize;
use serde_json::{Map, json};

#[tokio::main]
async fn main() -> flow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let app = Application::new(config)?;
    app.start_timer(Arc::new(Heartbeat)).await;

    let public = RouterGroup::new()
        .get("/users/:id", get_user)
        .post("/login", login)
        .post("/refresh", refresh)
        .get("/files/*name", download);
    let private = RouterGroup::new()
        .middleware(require_token)
        .get("/me", me);

    app.run(Router::new().mount(public).mount(private)).await
}

// GET /users/:id
async fn get_user(ctx: Context) {
    let id = ctx.int64_param("id");
    ctx.json(&json!({ "id": id, "name": "alice" }));
}

#[derive(Deserialize)]
struct Login {
    name: String,
}

impl Bind for Login {
    const REQUIRED: &'static [&'static str] = &["name"];
}

// POST /login
async fn login(ctx: Context) {
    let login = match ctx.parse::<Login>() {
        Ok(login) => login,
        Err(e) => {
            ctx.set_status(400);
            ctx.text(e.to_string());
            return;
        }
    };

    let mut claims = Map::new();
    claims.insert("name".into(), json!(login.name));
    match ctx.jwt().sign(claims) {
        Ok(token) => ctx.json(&json!({ "token": token })),
        Err(e) => {
            ctx.set_status(500);
            ctx.text(e.to_string());
        }
    }
}

async fn require_token(ctx: Context, next: Next) {
    let verified = ctx.header("authorization").map(|token| ctx.jwt().verify(token));
    match verified {
        Some(Ok(claims)) => {
            ctx.set_data("claims", claims);
            next.run().await;
        }
        _ => {
            ctx.set_status(401);
            ctx.text("unauthorized");
        }
    }
}

// GET /me
async fn me(ctx: Context) {
    match ctx.get_data::<Map<String, serde_json::Value>>("claims") {
        Some(claims) => ctx.json(&*claims),
        None => ctx.set_status(401).text("unauthorized"),
    }
}

// GET /files/*name
async fn download(ctx: Context) {
    let name = ctx.string_param("name");
    if name.split('/').any(|segment| segment == "..") {
        ctx.set_status(400).text("bad path");
        return;
    }
    ctx.download(name).await;
}

// POST /refresh
//
// Calls arriving within a second of each other trigger one refresh.
async fn refresh(ctx: Context) {
    ctx.app().execute_async_task(Arc::new(CacheRefresh::default()));
    ctx.set_status(202);
    ctx.text("scheduled");
}

#[derive(Default)]
struct CacheRefresh {
    coalesced: AtomicUsize,
}

#[async_trait]
impl Task for CacheRefresh {
    async fn execute(&self, _: &Application, _: Cancellation) -> TaskResult {
        TaskResult::ok(json!({ "coalesced": self.coalesced.load(Ordering::SeqCst) }))
    }

    async fn completed(&self, _: &Application, result: TaskResult) {
        tracing::info!(data = ?result.data, "cache refreshed");
    }

    fn timeout_after(&self) -> Duration { Duration::from_secs(5) }
    fn delay(&self) -> Duration { Duration::from_secs(1) }
}

impl AsyncTask for CacheRefresh {
    fn name(&self) -> &str { "cache-refresh" }

    fn aggregate(&self, _: &Application, _incoming: Arc<dyn AsyncTask>) {
        self.coalesced.fetch_add(1, Ordering::SeqCst);
    }
}

struct Heartbeat;

#[async_trait]
impl Timer for Heartbeat {
    fn name(&self) -> &str { "heartbeat" }

    async fn run(&self, _: &Application) {
        tracing::debug!("heartbeat");
    }

    fn interval(&self) -> Duration { Duration::from_secs(30) }
}
