//! Configuration blocks.
//!
//! Each block carries its own defaults, so a TOML file only needs the keys
//! that differ. The whole [`Config`] is handed to
//! [`Application::new`](crate::Application::new) once and is read-only from
//! then on.
//!
//! ```toml
//! [server]
//! app_name = "shop"
//! port = 8080
//! proxy = true
//!
//! [redis]
//! enable = true
//! prefix = "shop"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// All configuration blocks, one of each.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub cors: CorsConfig,
    pub jwt: JwtConfig,
    pub http_client: HttpClientConfig,
    pub redis: RedisConfig,
    pub orm: OrmConfig,
}

impl Config {
    /// Parses a TOML document, fills defaults and validates the result.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        let orm = config.orm.clone();
        let config = config.with_orm(Some(orm));
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_server(mut self, server: Option<ServerConfig>) -> Self {
        self.server = server.unwrap_or_default();
        self
    }

    pub fn with_logger(mut self, logger: Option<LoggerConfig>) -> Self {
        self.logger = logger.unwrap_or_default();
        self
    }

    pub fn with_cors(mut self, cors: Option<CorsConfig>) -> Self {
        self.cors = cors.unwrap_or_default();
        self
    }

    pub fn with_jwt(mut self, jwt: Option<JwtConfig>) -> Self {
        self.jwt = jwt.unwrap_or_default();
        self
    }

    pub fn with_http_client(mut self, http_client: Option<HttpClientConfig>) -> Self {
        self.http_client = http_client.unwrap_or_default();
        self
    }

    pub fn with_redis(mut self, redis: Option<RedisConfig>) -> Self {
        self.redis = redis.unwrap_or_default();
        self
    }

    /// Sets the ORM block. A missing pool sub-block is back-filled with
    /// [`OrmPool::default`].
    pub fn with_orm(mut self, orm: Option<OrmConfig>) -> Self {
        let mut orm = orm.unwrap_or_default();
        if orm.pool.is_none() {
            orm.pool = Some(OrmPool::default());
        }
        self.orm = orm;
        self
    }

    /// Checks value ranges. Reports every problem found, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.server.app_name.trim().is_empty() {
            problems.push("server.app_name must not be empty".to_owned());
        }
        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_owned());
        }
        if self.server.host.trim().is_empty() {
            problems.push("server.host must not be empty".to_owned());
        }
        if self.server.static_path.trim().is_empty() {
            problems.push("server.static_path must not be empty".to_owned());
        }
        if self.server.view_path.trim().is_empty() {
            problems.push("server.view_path must not be empty".to_owned());
        }
        if self.server.max_body_bytes == 0 {
            problems.push("server.max_body_bytes must be non-zero".to_owned());
        }
        if tracing::Level::from_str(&self.logger.level).is_err() {
            problems.push(format!("logger.level `{}` is not a known level", self.logger.level));
        }
        if self.logger.max_age_days == 0 {
            problems.push("logger.max_age_days must be at least 1".to_owned());
        }
        if self.redis.enable && self.redis.host.trim().is_empty() {
            problems.push("redis.host must be set when redis is enabled".to_owned());
        }
        if self.orm.enable && self.orm.host.trim().is_empty() {
            problems.push("orm.host must be set when orm is enabled".to_owned());
        }
        if self.orm.enable && self.orm.db_name.trim().is_empty() {
            problems.push("orm.db_name must be set when orm is enabled".to_owned());
        }

        if problems.is_empty() { Ok(()) } else { Err(Error::InvalidConfig(problems)) }
    }
}

/// Listener and filesystem settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub app_name: String,
    /// Trust `X-Forwarded-Host` / `X-Forwarded-Proto` from a fronting proxy.
    pub proxy: bool,
    pub host: String,
    pub port: u16,
    /// Base directory for relative [`Context::download`](crate::Context::download) paths.
    pub static_path: String,
    /// Template root for [`Context::render`](crate::Context::render).
    pub view_path: String,
    /// Largest non-multipart body read into memory. Multipart bodies are
    /// streamed and bounded per part instead.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_name: "flow".to_owned(),
            proxy: false,
            host: "127.0.0.1".to_owned(),
            port: 9505,
            static_path: "./statics".to_owned(),
            view_path: "./views".to_owned(),
            max_body_bytes: 32 << 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub path: String,
    pub max_age_days: usize,
    pub format_json: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_owned(),
            path: "./logs".to_owned(),
            max_age_days: 30,
            format_json: false,
        }
    }
}

/// Values copied verbatim into the CORS response headers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allowed_methods: String,
    pub allowed_headers: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_owned(),
            allowed_methods: "GET, POST, HEAD, OPTIONS, PUT, PATCH, DELETE, TRACE".to_owned(),
            allowed_headers: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Token lifetime in seconds.
    pub timeout_secs: u64,
    pub secret_key: String,
}

impl JwtConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self { timeout_secs: 24 * 60 * 60, secret_key: String::new() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_secs: u64,
    /// Sent with every outbound request.
    pub headers: HashMap<String, String>,
}

impl HttpClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { timeout_secs: 10, headers: HashMap::new() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enable: bool,
    pub password: String,
    pub db_num: i64,
    pub host: String,
    pub port: u16,
    /// Prepended to every key as `<prefix>-<key>`.
    pub prefix: String,
}

impl RedisConfig {
    /// Connection details passed to the client as fields, so the password
    /// never goes through URL parsing.
    pub(crate) fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db_num,
                password: (!self.password.is_empty()).then(|| self.password.clone()),
                ..Default::default()
            },
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enable: false,
            password: String::new(),
            db_num: 0,
            host: "127.0.0.1".to_owned(),
            port: 6379,
            prefix: "flow".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    pub enable: bool,
    pub user_name: String,
    pub password: String,
    pub db_name: String,
    pub host: String,
    pub port: u16,
    pub pool: Option<OrmPool>,
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            enable: false,
            user_name: "root".to_owned(),
            password: "root".to_owned(),
            db_name: String::new(),
            host: "127.0.0.1".to_owned(),
            port: 3306,
            pool: Some(OrmPool::default()),
        }
    }
}

/// Connection-pool limits. Lifetimes are in milliseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OrmPool {
    pub max_idle: u32,
    pub max_open: u32,
    pub conn_max_lifetime_ms: u64,
    pub conn_max_idle_time_ms: u64,
}

impl Default for OrmPool {
    fn default() -> Self {
        Self {
            max_idle: 5,
            max_open: 10,
            conn_max_lifetime_ms: 30_000,
            conn_max_idle_time_ms: 10_000,
        }
    }
}
