use crate::container::{ContainerRuntime, ContainerSpec, Launch};
use bollard::{
    container::{Config as ContainerConfig, CreateContainerOptions, StartContainerOptions},
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker,
};
use error_ext::BoxError;
use futures::TryStreamExt;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// [ContainerRuntime] backed by the Docker daemon.
///
/// Containers are looked up by name. A missing one is created and started, a stopped one is
/// started again, a running one is reused. Containers are never stopped or removed, hence they
/// outlive any runtime value, fixture and test process and are reused by the next run.
///
/// No lock is held while launching: concurrent creations race on the Docker daemon, which
/// accepts exactly one of them and answers the others with "409 Conflict".
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon given by `DOCKER_HOST`, defaulting to the local socket. No
    /// request is sent yet.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Whether the named container is running, `None` if there is no such container.
    async fn inspect(&self, name: &str) -> Result<Option<bool>, DockerError> {
        match self.docker.inspect_container(name, None).await {
            Ok(response) => {
                let running = response.state.and_then(|state| state.running);
                Ok(Some(running.unwrap_or_default()))
            }

            Err(error) if status_code(&error) == Some(404) => Ok(None),

            Err(error) => Err(error),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), DockerError> {
        self.pull_if_missing(spec).await?;

        let exposed_ports = spec
            .ports
            .iter()
            .map(|port| (format!("{}/tcp", port.container), HashMap::new()))
            .collect();
        let port_bindings = spec
            .ports
            .iter()
            .map(|port| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: Some(port.host.to_string()),
                };
                (format!("{}/tcp", port.container), Some(vec![binding]))
            })
            .collect();
        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let config = ContainerConfig {
            image: Some(format!("{}:{}", spec.image, spec.tag)),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        self.docker.create_container(Some(options), config).await?;

        Ok(())
    }

    async fn pull_if_missing(&self, spec: &ContainerSpec) -> Result<(), DockerError> {
        let image = format!("{}:{}", spec.image, spec.tag);
        match self.docker.inspect_image(&image).await {
            Ok(_) => Ok(()),

            Err(error) if status_code(&error) == Some(404) => {
                info!(%image, "pulling image");
                let options = CreateImageOptions {
                    from_image: spec.image.as_str(),
                    tag: spec.tag.as_str(),
                    ..Default::default()
                };
                self.docker
                    .create_image(Some(options), None, None)
                    .try_for_each(|_| async { Ok(()) })
                    .await
            }

            Err(error) => Err(error),
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(container = %spec.name))]
    async fn start(&self, spec: &ContainerSpec) -> Result<Launch, BoxError> {
        let launch = match self.inspect(&spec.name).await? {
            Some(true) => {
                debug!("container already running");
                return Ok(Launch::AlreadyRunning);
            }

            Some(false) => {
                info!("starting stopped container");
                Launch::Started
            }

            None => match self.create(spec).await {
                Ok(()) => {
                    info!(image = %spec.image, tag = %spec.tag, "created container");
                    Launch::Started
                }

                // Created concurrently, possibly not yet started; starting is idempotent.
                Err(error) if status_code(&error) == Some(409) => {
                    debug!("container created concurrently");
                    Launch::AlreadyRunning
                }

                Err(error) => return Err(error.into()),
            },
        };

        // Docker answers starting a running container with "304 Not Modified", which is success.
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;

        Ok(launch)
    }

    async fn is_running(&self, name: &str) -> Result<bool, BoxError> {
        let running = self.inspect(name).await?;
        Ok(running.unwrap_or_default())
    }
}

fn status_code(error: &DockerError) -> Option<u16> {
    match error {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}
