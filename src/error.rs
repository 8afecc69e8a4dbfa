//! Unified error type.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by flow's fallible operations.
///
/// Failures that end a request early (404, 500) are expressed as HTTP
/// responses by the recovery boundary, not as `Error`s. This type covers
/// what handlers and startup code can observe and react to.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding a port, accepting a connection, reading a file.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Every validation problem found, not just the first.
    #[error("invalid config: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// A field marked required was absent from the merged parameters.
    #[error("required field `{field}` is missing")]
    RequiredMissing { field: String },

    /// The request body could not be read. Recorded once per request.
    #[error("body read: {0}")]
    BodyRead(String),

    #[error("multipart: {0}")]
    Multipart(#[from] multer::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis returned nil for this key.
    #[error("{0}: key not exist")]
    KeyNotFound(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("logging: {0}")]
    Logging(String),
}
