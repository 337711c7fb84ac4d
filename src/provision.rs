use crate::pool::Config;
use sqlx::{postgres::PgConnectOptions, Connection, Executor, PgConnection, Row};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Prefix of generated database names.
pub const DATABASE_NAME_PREFIX: &str = "ephemeral";

/// Settings pinned for every created database, so behavior does not drift with the defaults of
/// the server or of the image version.
pub const PINNED_SETTINGS: &[(&str, &str)] = &[
    ("TimeZone", "UTC"),
    ("DateStyle", "ISO, MDY"),
    ("IntervalStyle", "postgres"),
    ("standard_conforming_strings", "on"),
];

/// Pool size of connection descriptors; a store may interleave reads and writes.
pub const DESCRIPTOR_MAX_CONNECTIONS: u32 = 10;

// Postgres truncates longer identifiers.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validated name of a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Generate a new name with a random v4 UUID suffix, unique within and across test runs.
    pub fn generate() -> Self {
        Self(format!("{DATABASE_NAME_PREFIX}-{}", Uuid::new_v4().simple()))
    }

    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidName(name, "must not be empty"));
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::InvalidName(name, "must not exceed 63 bytes"));
        }
        if name.contains('\0') {
            return Err(Error::InvalidName(name, "must not contain NUL"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl Display for DatabaseName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for DatabaseName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Creates and drops databases via an administrative connection to the maintenance database.
#[derive(Debug, Clone)]
pub struct DatabaseProvisioner {
    admin: Config,
}

impl DatabaseProvisioner {
    pub fn new(admin: Config) -> Self {
        Self { admin }
    }

    pub fn admin(&self) -> &Config {
        &self.admin
    }

    /// Create the database with the given name and pin its settings. No cleanup happens on
    /// failure, e.g. if the database is already there.
    #[instrument(skip(self, cancellation))]
    pub async fn create(
        &self,
        name: &DatabaseName,
        cancellation: &CancellationToken,
    ) -> Result<(), Error> {
        select! {
            biased;
            _ = cancellation.cancelled() => Err(Error::Cancelled(name.to_string())),
            result = self.execute_all(create_statements(name)) => {
                result?;
                info!(%name, "created database");
                Ok(())
            }
        }
    }

    /// Connection descriptor scoped to the database with the given name.
    pub fn connection_descriptor(&self, name: &DatabaseName) -> Config {
        Config {
            max_connections: DESCRIPTOR_MAX_CONNECTIONS,
            ..self.admin.for_database(name.as_str())
        }
    }

    /// Drop the database with the given name: block new connections, terminate the existing ones,
    /// thereby rolling back their transactions, and drop it.
    ///
    /// Connections of local pools must be closed before, else they get terminated too.
    #[instrument(skip(self))]
    pub async fn drop_database(&self, name: &DatabaseName) -> Result<(), Error> {
        let mut connection = self.connect().await?;

        let statement = format!("ALTER DATABASE {} WITH ALLOW_CONNECTIONS false", name.quoted());
        execute(&mut connection, &statement).await?;

        let terminated = sqlx::query(
            "SELECT pg_terminate_backend(pid)
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name.as_str())
        .fetch_all(&mut connection)
        .await
        .map_err(|error| Error::Sqlx("cannot terminate connections".to_string(), error))?
        .len();
        debug!(%name, terminated, "terminated connections");

        let statement = format!("DROP DATABASE {}", name.quoted());
        execute(&mut connection, &statement).await?;

        close(connection).await?;
        info!(%name, "dropped database");

        Ok(())
    }

    /// Whether the database with the given name exists.
    pub async fn exists(&self, name: &DatabaseName) -> Result<bool, Error> {
        let mut connection = self.connect().await?;
        let exists = sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name.as_str())
            .fetch_one(&mut connection)
            .await
            .and_then(|row| row.try_get::<bool, _>(0))
            .map_err(|error| Error::Sqlx("cannot query pg_database".to_string(), error))?;
        close(connection).await?;

        Ok(exists)
    }

    async fn execute_all(&self, statements: Vec<String>) -> Result<(), Error> {
        let mut connection = self.connect().await?;
        for statement in statements {
            execute(&mut connection, &statement).await?;
        }
        close(connection).await
    }

    async fn connect(&self) -> Result<PgConnection, Error> {
        let options = PgConnectOptions::from(self.admin.clone());
        PgConnection::connect_with(&options).await.map_err(|error| {
            Error::Sqlx(
                format!("cannot connect to {}:{}", self.admin.host, self.admin.port),
                error,
            )
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid database name {0:?}: {1}")]
    InvalidName(String, &'static str),

    #[error("{0}")]
    Sqlx(String, #[source] sqlx::Error),

    #[error("provisioning database {0} was cancelled")]
    Cancelled(String),
}

/// Statements creating the database with the given name; connections are blocked while the
/// settings get pinned.
fn create_statements(name: &DatabaseName) -> Vec<String> {
    let name = name.quoted();

    let mut statements = vec![
        format!("CREATE DATABASE {name}"),
        format!("ALTER DATABASE {name} WITH ALLOW_CONNECTIONS false"),
    ];
    statements.extend(PINNED_SETTINGS.iter().map(|(setting, value)| {
        format!("ALTER DATABASE {name} SET {setting} TO '{}'", value.replace('\'', "''"))
    }));
    statements.push(format!("ALTER DATABASE {name} WITH ALLOW_CONNECTIONS true"));

    statements
}

async fn execute(connection: &mut PgConnection, statement: &str) -> Result<(), Error> {
    connection
        .execute(statement)
        .await
        .map_err(|error| Error::Sqlx(format!("cannot execute `{statement}`"), error))?;
    debug!(statement, "executed statement");
    Ok(())
}

async fn close(connection: PgConnection) -> Result<(), Error> {
    connection
        .close()
        .await
        .map_err(|error| Error::Sqlx("cannot close connection".to_string(), error))
}
