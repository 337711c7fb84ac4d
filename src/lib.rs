//! Ephemeral Postgres databases for integration tests.
//!
//! A [Fixture] makes sure a shared Postgres container is running, creates a uniquely named
//! database in it, opens the [Store] under test against that database and drops the database
//! again on [Fixture::dispose]. The container itself is never stopped; it is reused by all
//! fixtures, runtimes and later test runs:
//!
//! ```no_run
//! # use ephemeral::{DockerRuntime, ContainerHandle, Fixture, Settings, Store, StoreSettings};
//! # use error_ext::BoxError;
//! # use std::sync::Arc;
//! # struct Entries;
//! # impl Store for Entries {
//! #     async fn open(_settings: StoreSettings) -> Result<Self, BoxError> { Ok(Entries) }
//! #     async fn create_schema(&self) -> Result<(), BoxError> { Ok(()) }
//! # }
//! # async fn run() -> Result<(), BoxError> {
//! let settings = Settings::load()?;
//! let runtime = Arc::new(DockerRuntime::new()?);
//! let container = ContainerHandle::new(settings.container_spec(), runtime);
//! let mut fixture = Fixture::new(container, settings.provisioner(), settings.fixture_config());
//!
//! let entries = fixture.setup::<Entries>().await?;
//! // Exercise `entries`.
//! fixture.dispose().await?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod container;
mod docker;
mod fixture;
mod pool;
mod provision;

pub use clock::Clock;
pub use config::Settings;
pub use container::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, Error as ContainerError,
    Launch, PortMapping, Readiness,
};
pub use docker::DockerRuntime;
pub use fixture::{
    DatabaseHandle, Disposal, Error, Fixture, FixtureConfig, FixtureState, Store, StoreSettings,
};
pub use pool::{Config, Pool};
pub use provision::{
    DatabaseName, DatabaseProvisioner, Error as ProvisionError, DATABASE_NAME_PREFIX,
    DESCRIPTOR_MAX_CONNECTIONS, PINNED_SETTINGS,
};
