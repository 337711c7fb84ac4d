use crate::{
    container::{ContainerSpec, Readiness},
    fixture::FixtureConfig,
    pool::Config,
    provision::DatabaseProvisioner,
};
use configured::Configured;
use error_ext::BoxError;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use sqlx::postgres::PgSslMode;
use std::time::Duration;

const POSTGRES_PORT: u16 = 5432;
const POSTGRES_USER: &str = "postgres";
const POSTGRES_MAINTENANCE_DB: &str = "postgres";

/// Settings for the shared Postgres container and the fixtures using it.
///
/// Every field has a default; use [Settings::load] to override them from configuration files or
/// `APP__` prefixed environment variables.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub image: String,
    pub tag: String,
    pub container_name: String,
    pub host_port: u16,
    pub password: SecretString,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub startup_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    pub schema: String,
    pub retain_on_dispose: bool,
}

impl Settings {
    pub fn load() -> Result<Self, configured::Error> {
        <Self as Configured>::load()
    }

    /// Administrative connection configuration for the maintenance database.
    pub fn admin_config(&self) -> Config {
        Config {
            host: "localhost".to_string(),
            port: self.host_port,
            user: POSTGRES_USER.to_string(),
            password: self.password.clone(),
            dbname: POSTGRES_MAINTENANCE_DB.to_string(),
            sslmode: PgSslMode::Disable,
            max_connections: 1,
        }
    }

    /// The [ContainerSpec] for Postgres, ready as soon as it accepts connections.
    pub fn container_spec(&self) -> ContainerSpec {
        let admin = self.admin_config();
        let readiness = Readiness::new(move || {
            let admin = admin.clone();
            async move { admin.accepts_connections().await.map_err(BoxError::from) }
        });

        ContainerSpec::new(&self.image, &self.tag, &self.container_name)
            .with_port(POSTGRES_PORT, self.host_port)
            .with_env("POSTGRES_PASSWORD", self.password.expose_secret())
            .with_poll_interval(self.poll_interval)
            .with_readiness(readiness)
    }

    pub fn provisioner(&self) -> DatabaseProvisioner {
        DatabaseProvisioner::new(self.admin_config())
    }

    pub fn fixture_config(&self) -> FixtureConfig {
        FixtureConfig::new(&self.schema)
            .with_retain_on_dispose(self.retain_on_dispose)
            .with_startup_timeout(self.startup_timeout)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image: "postgres".to_string(),
            tag: "16-alpine".to_string(),
            container_name: "ephemeral-tests-postgres".to_string(),
            host_port: 15432,
            password: "postgres".to_string().into(),
            startup_timeout: Duration::from_secs(3 * 60),
            poll_interval: Duration::from_millis(500),
            schema: "public".to_string(),
            retain_on_dispose: false,
        }
    }
}
