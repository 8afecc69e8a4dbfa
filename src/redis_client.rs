//! Key-prefixed Redis access.
//!
//! The connection manager is created on first use, so building an
//! [`Application`](crate::Application) with redis enabled never blocks on
//! the server being reachable.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// A raw string value read from Redis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisResult(String);

impl RedisResult {
    pub fn raw(&self) -> &str { &self.0 }

    pub fn into_string(self) -> String { self.0 }

    /// Decodes the value as JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.0)?)
    }
}

pub struct RedisClient {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    prefix: String,
}

impl RedisClient {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(config.connection_info())?,
            manager: OnceCell::new(),
            prefix: config.prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}-{key}", self.prefix)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self.manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    pub async fn get(&self, key: &str) -> Result<RedisResult> {
        self.get_without_prefix(&self.key(key)).await
    }

    /// Stores `value` under the prefixed `key`, expiring after `ttl` if given.
    ///
    /// Strings are stored as they are, anything else as JSON.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set_without_prefix(&self.key(key), value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.delete_without_prefix(&self.key(key)).await
    }

    pub async fn get_without_prefix(&self, key: &str) -> Result<RedisResult> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        value.map(RedisResult).ok_or_else(|| Error::KeyNotFound(key.to_owned()))
    }

    pub async fn set_without_prefix<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = encode(value)?;
        let mut conn = self.connection().await?;
        match ttl.map(|t| t.as_secs().max(1)) {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    pub async fn delete_without_prefix(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Every full key starting with the prefixed `prefix`.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.keys(format!("{}*", self.key(prefix))).await?)
    }

    /// Deletes every key [`keys`](Self::keys) returns for `prefix`.
    pub async fn delete_keys(&self, prefix: &str) -> Result<usize> {
        let keys = self.keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(&keys).await?;
        Ok(keys.len())
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(match serde_json::to_value(value)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}
