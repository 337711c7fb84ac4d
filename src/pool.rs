//! Connection pool for sqlx with Postgres, scoped to a single database.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    Connection, PgConnection, PgPool,
};
use std::{ops::Deref, time::Duration};
use tokio::time::timeout;
use tracing::debug;

/// New type for `PgPool`, allowing for some custom extensions as well as security.
///
/// All clones share the same connections, hence closing one closes them all. To use as `&PgPool`
/// in `Query::execute`, use its `Deref` implementation: `&*pool` or `pool.deref()`.
#[derive(Debug, Clone)]
pub struct Pool(PgPool);

impl Pool {
    /// Try to create a new [Pool] with the given [Config], eagerly opening a connection.
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let pg_pool = config.pool_options().connect_with(config.into()).await?;
        let pool = Pool(pg_pool);
        debug!(?pool, "created pool");

        Ok(pool)
    }

    /// Create a new [Pool] with the given [Config] without connecting; connections are opened on
    /// first use. Requires a Tokio runtime.
    pub fn lazy(config: Config) -> Self {
        let pg_pool = config.pool_options().connect_lazy_with(config.into());
        let pool = Pool(pg_pool);
        debug!(?pool, "created lazy pool");

        pool
    }

    /// Close all pooled connections, waiting for checked out ones to be returned. Afterwards no
    /// connection is bound to the database via this pool or any of its clones.
    pub async fn close(&self) {
        self.0.close().await;
        debug!(pool = ?self, "closed pool");
    }

    /// Close the pool like [Pool::close], but wait at most `max_wait` for checked out connections
    /// to be returned. Returns whether all connections are closed; the pool is closed for new
    /// acquisitions either way, but connections still checked out stay open until returned.
    pub async fn close_within(&self, max_wait: Duration) -> bool {
        let closed = timeout(max_wait, self.0.close()).await.is_ok();
        debug!(pool = ?self, closed, "closed pool within {max_wait:?}");
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl Deref for Pool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Configuration for [Pool], also used as connection descriptor for a single database.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub dbname: String,
    #[serde_as(as = "DisplayFromStr")]
    pub sslmode: PgSslMode,
    #[serde(default = "max_connections_default")]
    pub max_connections: u32,
}

impl Config {
    /// The same endpoint and credentials, scoped to the given database.
    pub fn for_database(&self, dbname: impl Into<String>) -> Self {
        Self {
            dbname: dbname.into(),
            ..self.clone()
        }
    }

    /// Whether a connection can be opened and pinged; any failure is returned as error.
    pub async fn accepts_connections(&self) -> Result<bool, sqlx::Error> {
        let options = PgConnectOptions::from(self.clone());
        let mut connection = PgConnection::connect_with(&options).await?;
        connection.ping().await?;
        connection.close().await?;
        Ok(true)
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new().max_connections(self.max_connections)
    }
}

impl From<Config> for PgConnectOptions {
    fn from(config: Config) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&config.host)
            .username(&config.user)
            .password(config.password.expose_secret())
            .database(&config.dbname)
            .port(config.port)
            .ssl_mode(config.sslmode)
            .application_name(env!("CARGO_PKG_NAME"))
    }
}

fn max_connections_default() -> u32 {
    10
}
