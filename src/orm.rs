//! MySQL connection pool.

use std::time::Duration;

use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

use crate::config::OrmConfig;
use crate::error::Result;

/// Holds the shared pool. Connections are opened on first use.
#[derive(Clone)]
pub struct Orm {
    pool: MySqlPool,
}

impl Orm {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &OrmConfig) -> Result<Self> {
        let limits = config.pool.clone().unwrap_or_default();
        let pool = MySqlPoolOptions::new()
            .max_connections(limits.max_open)
            .max_lifetime(Duration::from_millis(limits.conn_max_lifetime_ms))
            .idle_timeout(Duration::from_millis(limits.conn_max_idle_time_ms))
            .connect_lazy_with(connect_options(config));
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool { &self.pool }
}

/// Credentials go in as fields, so they never pass through URL parsing.
fn connect_options(config: &OrmConfig) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user_name)
        .password(&config.password)
        .database(&config.db_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrmPool;

    #[tokio::test]
    async fn pool_limits_come_from_config() {
        let config = OrmConfig {
            enable: true,
            db_name: "shop".into(),
            pool: Some(OrmPool { max_open: 4, ..OrmPool::default() }),
            ..OrmConfig::default()
        };
        let orm = Orm::new(&config).unwrap();
        assert_eq!(orm.pool().options().get_max_connections(), 4);
    }

    #[test]
    fn credentials_with_url_delimiters_keep_host_and_database() {
        let config = OrmConfig {
            password: "p@ss/w:rd".into(),
            host: "db.internal".into(),
            port: 3307,
            db_name: "shop".into(),
            ..OrmConfig::default()
        };
        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 3307);
        assert_eq!(options.get_database(), Some("shop"));
    }
}
