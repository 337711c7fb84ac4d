use crate::{
    clock::Clock,
    container::{self, ContainerHandle, ContainerRuntime},
    pool::{Config, Pool},
    provision::{self, DatabaseName, DatabaseProvisioner},
};
use error_ext::BoxError;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const STARTUP_TIMEOUT_DEFAULT: Duration = Duration::from_secs(3 * 60);
const POOL_CLOSE_MAX_WAIT: Duration = Duration::from_millis(500);

/// The store under test, opened by a [Fixture] against its database.
#[trait_variant::make(Send)]
pub trait Store: Sized {
    async fn open(settings: StoreSettings) -> Result<Self, BoxError>;

    /// Create the tables etc. the store needs.
    async fn create_schema(&self) -> Result<(), BoxError>;
}

/// What a [Store] is opened with.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Pool for the fixture's database, closed on disposal.
    pub pool: Pool,
    pub descriptor: Config,
    pub schema: String,
    pub clock: Clock,
}

/// Configuration for [Fixture].
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub schema: String,
    /// Keep the database on disposal, e.g. for post-mortem inspection.
    pub retain_on_dispose: bool,
    pub startup_timeout: Duration,
    pub clock: Clock,
}

impl FixtureConfig {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            retain_on_dispose: false,
            startup_timeout: STARTUP_TIMEOUT_DEFAULT,
            clock: Clock::system(),
        }
    }

    pub fn with_retain_on_dispose(mut self, retain_on_dispose: bool) -> Self {
        self.retain_on_dispose = retain_on_dispose;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// The database of a [Fixture].
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    pub name: DatabaseName,
    pub descriptor: Config,
    /// Name of the container hosting the database, which the fixture does not own.
    pub container: String,
    pub provisioned_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Uninitialized,
    ContainerStarting,
    DatabaseProvisioned,
    StoreReady,
    Disposed(Disposal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Dropped,
    Retained,
    /// The database was never created, hence nothing was dropped.
    Unprovisioned,
}

/// Provides a store under test with a private database in a shared container and drops that
/// database again on [Fixture::dispose].
///
/// A fixture owns exactly one database, named uniquely at construction; setting up more stores
/// reuses it. Taking `&mut self` rules out concurrent setups of the same fixture.
pub struct Fixture<R> {
    container: ContainerHandle<R>,
    provisioner: DatabaseProvisioner,
    config: FixtureConfig,
    database: DatabaseHandle,
    pool: Option<Pool>,
    state: FixtureState,
    cancellation: CancellationToken,
}

impl<R> Fixture<R>
where
    R: ContainerRuntime,
{
    pub fn new(
        container: ContainerHandle<R>,
        provisioner: DatabaseProvisioner,
        config: FixtureConfig,
    ) -> Self {
        let name = DatabaseName::generate();
        let database = DatabaseHandle {
            descriptor: provisioner.connection_descriptor(&name),
            container: container.spec().name.clone(),
            name,
            provisioned_at: None,
        };

        Self {
            container,
            provisioner,
            config,
            database,
            pool: None,
            state: FixtureState::Uninitialized,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> FixtureState {
        self.state
    }

    pub fn database(&self) -> &DatabaseHandle {
        &self.database
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    /// Token to abort container startup and provisioning of a pending setup.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Set up a store with the configured schema in a freshly provisioned database.
    pub async fn setup<S>(&mut self) -> Result<S, Error>
    where
        S: Store,
    {
        let schema = self.config.schema.clone();
        self.setup_with_schema(&schema).await
    }

    /// Set up a store with the given schema. The database is provisioned only once, later calls
    /// open further stores in the same database.
    #[instrument(skip(self), fields(database = %self.database.name))]
    pub async fn setup_with_schema<S>(&mut self, schema: &str) -> Result<S, Error>
    where
        S: Store,
    {
        let pool = self.provision().await?;
        let store = self.open_store::<S>(pool, schema).await?;
        store
            .create_schema()
            .await
            .map_err(|error| Error::Store(self.database.name.to_string(), error))?;

        self.state = FixtureState::StoreReady;
        Ok(store)
    }

    /// Set up a store in a freshly provisioned database without creating its schema.
    #[instrument(skip(self), fields(database = %self.database.name))]
    pub async fn setup_uninitialized<S>(&mut self) -> Result<S, Error>
    where
        S: Store,
    {
        let pool = self.provision().await?;
        let schema = self.config.schema.clone();
        let store = self.open_store::<S>(pool, &schema).await?;

        self.state = FixtureState::StoreReady;
        Ok(store)
    }

    /// Set up a store whose database is not provisioned, i.e. does not exist, unless an earlier
    /// setup created it. Connections are opened lazily, so the store fails only when used.
    #[instrument(skip(self), fields(database = %self.database.name))]
    pub async fn setup_without_provisioning<S>(&mut self) -> Result<S, Error>
    where
        S: Store,
    {
        self.ensure_container_started().await?;
        let pool = self.pool();
        let schema = self.config.schema.clone();
        let store = self.open_store::<S>(pool, &schema).await?;

        self.state = FixtureState::StoreReady;
        Ok(store)
    }

    /// Close the pool and drop the database, unless retention is configured or the database was
    /// never provisioned. Calling it again after success returns the same [Disposal].
    ///
    /// A failure leaves the fixture undisposed: the database may have leaked.
    #[instrument(skip(self), fields(database = %self.database.name))]
    pub async fn dispose(&mut self) -> Result<Disposal, Error> {
        if let FixtureState::Disposed(disposal) = self.state {
            return Ok(disposal);
        }

        let disposal = if self.database.provisioned_at.is_none() {
            self.close_pool().await;
            debug!("database not provisioned, nothing to drop");
            Disposal::Unprovisioned
        } else if self.config.retain_on_dispose {
            info!("retaining database");
            Disposal::Retained
        } else {
            // Postgres refuses to drop a database with open connections.
            self.close_pool().await;
            self.provisioner
                .drop_database(&self.database.name)
                .await
                .map_err(|error| Error::Teardown(self.database.name.to_string(), error))?;
            Disposal::Dropped
        };

        self.state = FixtureState::Disposed(disposal);
        Ok(disposal)
    }

    async fn ensure_container_started(&mut self) -> Result<(), Error> {
        if let FixtureState::Disposed(_) = self.state {
            return Err(Error::Disposed(self.database.name.to_string()));
        }

        if self.state == FixtureState::Uninitialized {
            self.state = FixtureState::ContainerStarting;
        }
        self.container
            .ensure_started(self.config.startup_timeout, &self.cancellation)
            .await?;

        Ok(())
    }

    async fn provision(&mut self) -> Result<Pool, Error> {
        if self.database.provisioned_at.is_none() {
            self.ensure_container_started().await?;
            self.provisioner
                .create(&self.database.name, &self.cancellation)
                .await
                .map_err(|error| Error::Provisioning(self.database.name.to_string(), error))?;

            let provisioned_at = self.config.clock.now();
            self.database.provisioned_at = Some(provisioned_at);
            self.state = FixtureState::DatabaseProvisioned;
            debug!(%provisioned_at, "provisioned database");
        } else if let FixtureState::Disposed(_) = self.state {
            return Err(Error::Disposed(self.database.name.to_string()));
        }

        Ok(self.pool())
    }

    async fn open_store<S>(&self, pool: Pool, schema: &str) -> Result<S, Error>
    where
        S: Store,
    {
        let settings = StoreSettings {
            pool,
            descriptor: self.database.descriptor.clone(),
            schema: schema.to_string(),
            clock: self.config.clock.clone(),
        };

        S::open(settings)
            .await
            .map_err(|error| Error::Store(self.database.name.to_string(), error))
    }

    fn pool(&mut self) -> Pool {
        self.pool
            .get_or_insert_with(|| Pool::lazy(self.database.descriptor.clone()))
            .clone()
    }

    /// Connections still checked out, e.g. by an open transaction, are left to
    /// [DatabaseProvisioner::drop_database], which terminates them.
    async fn close_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            if pool.close_within(POOL_CLOSE_MAX_WAIT).await {
                debug!("cleared pooled connections");
            } else {
                debug!("cleared idle pooled connections, others still checked out");
            }
        }
    }
}

impl<R> Drop for Fixture<R> {
    fn drop(&mut self) {
        let disposed = matches!(self.state, FixtureState::Disposed(_));
        if !disposed && self.database.provisioned_at.is_some() && !self.config.retain_on_dispose {
            warn!(
                database = %self.database.name,
                "fixture dropped without being disposed, database leaked"
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Container(#[from] container::Error),

    #[error("cannot provision database {0}")]
    Provisioning(String, #[source] provision::Error),

    #[error("cannot tear down database {0}")]
    Teardown(String, #[source] provision::Error),

    #[error("cannot set up store for database {0}")]
    Store(String, #[source] BoxError),

    #[error("fixture for database {0} already disposed")]
    Disposed(String),
}

#[cfg(test)]
mod tests {
    use crate::{
        clock::Clock,
        container::{self, ContainerHandle, ContainerRuntime, ContainerSpec, Launch},
        docker::{tests::shared_settings, DockerRuntime},
        fixture::{Disposal, Error, Fixture, FixtureConfig, FixtureState, Store, StoreSettings},
        pool::{Config, Pool},
        provision::{self, DatabaseProvisioner},
    };
    use assert_matches::assert_matches;
    use error_ext::BoxError;
    use futures::future::join_all;
    use sqlx::{
        postgres::{PgConnectOptions, PgSslMode},
        Connection, Executor, PgConnection, Row,
    };
    use std::{collections::HashSet, sync::Arc, time::Duration};
    use time::OffsetDateTime;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    struct ReadyRuntime;

    impl ContainerRuntime for ReadyRuntime {
        async fn start(&self, _spec: &ContainerSpec) -> Result<Launch, BoxError> {
            Ok(Launch::AlreadyRunning)
        }

        async fn is_running(&self, _name: &str) -> Result<bool, BoxError> {
            Ok(true)
        }
    }

    struct FailingRuntime;

    impl ContainerRuntime for FailingRuntime {
        async fn start(&self, _spec: &ContainerSpec) -> Result<Launch, BoxError> {
            Err("image not found".into())
        }

        async fn is_running(&self, _name: &str) -> Result<bool, BoxError> {
            Ok(false)
        }
    }

    /// Key-value entries in a table of the configured schema.
    #[derive(Debug)]
    struct Entries {
        pool: Pool,
        schema: String,
        clock: Clock,
    }

    impl Store for Entries {
        async fn open(settings: StoreSettings) -> Result<Self, BoxError> {
            Ok(Self {
                pool: settings.pool,
                schema: settings.schema,
                clock: settings.clock,
            })
        }

        async fn create_schema(&self) -> Result<(), BoxError> {
            let ddl = format!(
                r#"CREATE SCHEMA IF NOT EXISTS "{0}";
                   CREATE TABLE IF NOT EXISTS "{0}".entries (
                       key text PRIMARY KEY,
                       value text NOT NULL,
                       created_at timestamptz NOT NULL
                   );"#,
                self.schema
            );
            (&*self.pool).execute(ddl.as_str()).await?;
            Ok(())
        }
    }

    impl Entries {
        async fn append(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
            let statement = format!(r#"INSERT INTO "{}".entries VALUES ($1, $2, $3)"#, self.schema);
            sqlx::query(&statement)
                .bind(key)
                .bind(value)
                .bind(self.clock.now())
                .execute(&*self.pool)
                .await?;
            Ok(())
        }

        async fn read(&self, key: &str) -> Result<Option<(String, OffsetDateTime)>, sqlx::Error> {
            let query = format!(
                r#"SELECT value, created_at FROM "{}".entries WHERE key = $1"#,
                self.schema
            );
            sqlx::query(&query)
                .bind(key)
                .fetch_optional(&*self.pool)
                .await?
                .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
                .transpose()
        }
    }

    fn unreachable_provisioner() -> DatabaseProvisioner {
        DatabaseProvisioner::new(Config {
            host: "localhost".to_string(),
            port: 1,
            user: "postgres".to_string(),
            password: "postgres".to_string().into(),
            dbname: "postgres".to_string(),
            sslmode: PgSslMode::Disable,
            max_connections: 1,
        })
    }

    fn test_fixture<R>(runtime: R) -> Fixture<R>
    where
        R: ContainerRuntime,
    {
        let spec = ContainerSpec::new("postgres", "16-alpine", "ephemeral-test")
            .with_poll_interval(Duration::from_millis(10));
        let config = FixtureConfig::new("dbo").with_startup_timeout(Duration::from_secs(1));
        Fixture::new(
            ContainerHandle::new(spec, Arc::new(runtime)),
            unreachable_provisioner(),
            config,
        )
    }

    fn docker_fixture(config: FixtureConfig) -> Result<Fixture<DockerRuntime>, BoxError> {
        let settings = shared_settings();
        let container =
            ContainerHandle::new(settings.container_spec(), Arc::new(DockerRuntime::new()?));
        Ok(Fixture::new(container, settings.provisioner(), config))
    }

    async fn connect(descriptor: &Config) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&PgConnectOptions::from(descriptor.clone())).await
    }

    fn is_unknown_database(error: &sqlx::Error) -> bool {
        matches!(error, sqlx::Error::Database(error) if error.code().as_deref() == Some("3D000"))
    }

    #[test]
    fn test_new() {
        let fixture = test_fixture(ReadyRuntime);

        assert_eq!(fixture.state(), FixtureState::Uninitialized);
        assert_eq!(fixture.database().container, "ephemeral-test");
        assert_eq!(
            fixture.database().descriptor.dbname,
            fixture.database().name.as_str()
        );
        assert!(fixture.database().provisioned_at.is_none());
        assert_eq!(fixture.config().schema, "dbo");
        assert!(!fixture.config().retain_on_dispose);
    }

    #[test]
    fn test_unique_database_names() {
        let names = (0..1_000)
            .map(|_| test_fixture(ReadyRuntime).database().name.clone())
            .collect::<HashSet<_>>();
        assert_eq!(names.len(), 1_000);
    }

    #[tokio::test]
    async fn test_dispose_uninitialized() {
        let mut fixture = test_fixture(ReadyRuntime);

        let disposal = fixture.dispose().await;
        assert_matches!(disposal, Ok(Disposal::Unprovisioned));
        assert_eq!(
            fixture.state(),
            FixtureState::Disposed(Disposal::Unprovisioned)
        );

        let disposal = fixture.dispose().await;
        assert_matches!(disposal, Ok(Disposal::Unprovisioned));

        let result = fixture.setup::<Entries>().await;
        assert_matches!(result, Err(Error::Disposed(_)));
    }

    #[tokio::test]
    async fn test_setup_container_failure() {
        let mut fixture = test_fixture(FailingRuntime);

        let result = fixture.setup::<Entries>().await;
        assert_matches!(result, Err(Error::Container(container::Error::Start(..))));
        assert_eq!(fixture.state(), FixtureState::ContainerStarting);
        assert!(fixture.database().provisioned_at.is_none());

        let disposal = fixture.dispose().await;
        assert_matches!(disposal, Ok(Disposal::Unprovisioned));
    }

    #[tokio::test]
    async fn test_setup_provisioning_failure() {
        let mut fixture = test_fixture(ReadyRuntime);

        let result = fixture.setup::<Entries>().await;
        assert_matches!(
            result,
            Err(Error::Provisioning(name, provision::Error::Sqlx(..)))
                if name == fixture.database().name.as_str()
        );
        assert_eq!(fixture.state(), FixtureState::ContainerStarting);

        let disposal = fixture.dispose().await;
        assert_matches!(disposal, Ok(Disposal::Unprovisioned));
    }

    #[tokio::test]
    async fn test_setup_cancelled() {
        let mut fixture = test_fixture(ReadyRuntime);
        fixture.cancellation_token().cancel();

        let result = fixture.setup::<Entries>().await;
        assert_matches!(result, Err(Error::Container(container::Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_setup_without_provisioning_lazy() {
        let mut fixture = test_fixture(ReadyRuntime);

        let entries = fixture.setup_without_provisioning::<Entries>().await;
        assert!(entries.is_ok());
        assert_eq!(fixture.state(), FixtureState::StoreReady);
        assert!(fixture.database().provisioned_at.is_none());

        let disposal = fixture.dispose().await;
        assert_matches!(disposal, Ok(Disposal::Unprovisioned));
        assert!(entries.unwrap().pool.is_closed());
    }

    #[test]
    #[traced_test]
    fn test_drop_undisposed() {
        let mut fixture = test_fixture(ReadyRuntime);
        fixture.database.provisioned_at = Some(OffsetDateTime::UNIX_EPOCH);
        drop(fixture);

        assert!(logs_contain("database leaked"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_setup_and_dispose() -> Result<(), BoxError> {
        let settings = shared_settings();
        let at = OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000);
        let config = FixtureConfig::new("dbo").with_clock(Clock::fixed(at));
        let mut fixture = docker_fixture(config)?;

        let entries = fixture.setup::<Entries>().await?;
        assert_eq!(fixture.state(), FixtureState::StoreReady);
        assert_eq!(fixture.database().provisioned_at, Some(at));

        entries.append("greeting", "hello").await?;
        let entry = entries.read("greeting").await?;
        assert_eq!(entry, Some(("hello".to_string(), at)));

        // One database per fixture: a further setup uses the same database.
        let name = fixture.database().name.clone();
        let other = fixture.setup_with_schema::<Entries>("other").await?;
        assert_eq!(fixture.database().name, name);
        assert!(other.read("greeting").await?.is_none());

        let descriptor = fixture.database().descriptor.clone();
        let disposal = fixture.dispose().await?;
        assert_eq!(disposal, Disposal::Dropped);
        assert_eq!(fixture.state(), FixtureState::Disposed(Disposal::Dropped));
        assert_matches!(entries.read("greeting").await, Err(sqlx::Error::PoolClosed));
        assert!(!settings.provisioner().exists(&name).await?);

        let result = connect(&descriptor).await;
        assert!(result.is_err_and(|error| is_unknown_database(&error)));
        assert!(logs_contain("dropped database"));

        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_with_open_transaction() -> Result<(), BoxError> {
        let mut fixture = docker_fixture(FixtureConfig::new("dbo"))?;
        let entries = fixture.setup::<Entries>().await?;

        let mut transaction = entries.pool.begin().await?;
        sqlx::query("CREATE TABLE pending (id integer PRIMARY KEY)")
            .execute(&mut *transaction)
            .await?;

        let disposal = timeout(Duration::from_secs(30), fixture.dispose()).await?;
        assert_matches!(disposal, Ok(Disposal::Dropped));

        // The backend of the transaction has been terminated.
        let result = transaction.commit().await;
        assert!(result.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_retained() -> Result<(), BoxError> {
        let settings = shared_settings();
        let config = FixtureConfig::new("dbo").with_retain_on_dispose(true);
        let mut fixture = docker_fixture(config)?;

        let entries = fixture.setup::<Entries>().await?;
        entries.append("greeting", "hello").await?;

        let disposal = fixture.dispose().await?;
        assert_eq!(disposal, Disposal::Retained);

        let mut connection = connect(&fixture.database().descriptor).await?;
        let value = sqlx::query(r#"SELECT value FROM "dbo".entries WHERE key = 'greeting'"#)
            .fetch_one(&mut connection)
            .await?
            .try_get::<String, _>(0)?;
        assert_eq!(value, "hello");
        connection.close().await?;

        settings
            .provisioner()
            .drop_database(&fixture.database().name)
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_setup_without_provisioning() -> Result<(), BoxError> {
        let mut fixture = docker_fixture(FixtureConfig::new("dbo"))?;

        let entries = fixture.setup_without_provisioning::<Entries>().await?;
        assert_eq!(fixture.state(), FixtureState::StoreReady);

        let result = entries.read("greeting").await;
        assert!(result.is_err_and(|error| is_unknown_database(&error)));

        let disposal = fixture.dispose().await?;
        assert_eq!(disposal, Disposal::Unprovisioned);

        Ok(())
    }

    #[tokio::test]
    async fn test_setup_uninitialized() -> Result<(), BoxError> {
        let mut fixture = docker_fixture(FixtureConfig::new("dbo"))?;

        let entries = fixture.setup_uninitialized::<Entries>().await?;
        let result = entries.read("greeting").await;
        assert_matches!(
            result,
            Err(sqlx::Error::Database(error)) if error.code().as_deref() == Some("42P01")
        );

        entries.create_schema().await?;
        assert!(entries.read("greeting").await?.is_none());

        let disposal = fixture.dispose().await?;
        assert_eq!(disposal, Disposal::Dropped);

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_fixtures() -> Result<(), BoxError> {
        let settings = shared_settings();
        let container =
            ContainerHandle::new(settings.container_spec(), Arc::new(DockerRuntime::new()?));
        let provisioner = settings.provisioner();

        let names = join_all((0..4).map(|n| {
            let mut fixture = Fixture::new(
                container.clone(),
                provisioner.clone(),
                FixtureConfig::new("dbo"),
            );
            async move {
                let entries = fixture.setup::<Entries>().await?;
                entries.append("n", &n.to_string()).await?;
                let name = fixture.database().name.clone();
                fixture.dispose().await?;
                Ok::<_, BoxError>(name)
            }
        }))
        .await
        .into_iter()
        .collect::<Result<HashSet<_>, _>>()?;
        assert_eq!(names.len(), 4);

        for name in names {
            assert!(!provisioner.exists(&name).await?);
        }

        Ok(())
    }
}
