use error_ext::BoxError;
use futures::{future::BoxFuture, FutureExt};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    select,
    time::{sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const POLL_INTERVAL_DEFAULT: Duration = Duration::from_millis(500);

/// The container control surface, e.g. Docker.
#[trait_variant::make(Send)]
pub trait ContainerRuntime {
    /// Start a container for the given [ContainerSpec]. A container with the same name which is
    /// already running must be reported as [Launch::AlreadyRunning], not as error.
    async fn start(&self, spec: &ContainerSpec) -> Result<Launch, BoxError>;

    /// Whether a container with the given name exists and is running.
    async fn is_running(&self, name: &str) -> Result<bool, BoxError>;
}

/// Outcome of [ContainerRuntime::start].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Started,
    AlreadyRunning,
}

/// Immutable description of a named, possibly shared container.
#[derive(Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub tag: String,
    pub name: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub poll_interval: Duration,
    pub readiness: Readiness,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            name: name.into(),
            ports: vec![],
            env: vec![],
            poll_interval: POLL_INTERVAL_DEFAULT,
            readiness: Readiness::always(),
        }
    }

    pub fn with_port(mut self, container: u16, host: u16) -> Self {
        self.ports.push(PortMapping { container, host });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

impl Debug for ContainerSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Values may hold credentials.
        let env = self.env.iter().map(|(key, _)| key).collect::<Vec<_>>();
        f.debug_struct("ContainerSpec")
            .field("image", &self.image)
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("env", &env)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
}

/// Readiness predicate, reporting whether a container can accept work.
#[derive(Clone)]
pub struct Readiness(Arc<dyn Fn() -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>);

impl Readiness {
    pub fn new<F, R>(check: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        Self(Arc::new(move || check().boxed()))
    }

    /// A predicate which is always satisfied.
    pub fn always() -> Self {
        Self::new(|| async { Ok(true) })
    }

    pub async fn check(&self) -> Result<bool, BoxError> {
        (self.0)().await
    }
}

impl Debug for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness").finish_non_exhaustive()
    }
}

/// State of a container, derived from the runtime and the readiness predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    NotStarted,
    Starting,
    Healthy,
    Failed,
}

/// Handle for a named container, shared by all fixtures using it; clones share the runtime.
#[derive(Debug)]
pub struct ContainerHandle<R> {
    spec: Arc<ContainerSpec>,
    runtime: Arc<R>,
}

impl<R> Clone for ContainerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<R> ContainerHandle<R>
where
    R: ContainerRuntime,
{
    pub fn new(spec: ContainerSpec, runtime: Arc<R>) -> Self {
        Self {
            spec: Arc::new(spec),
            runtime,
        }
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// Start the container or reuse an already running one with the same name, then poll the
    /// readiness predicate until it holds. The timeout bounds launch and polling together.
    ///
    /// Errors of the readiness predicate count as "not ready" and never surface.
    #[instrument(skip(self, cancellation), fields(container = %self.spec.name))]
    pub async fn ensure_started(
        &self,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let name = &self.spec.name;

        let launch = select! {
            biased;
            _ = cancellation.cancelled() => return Err(Error::Cancelled(name.clone())),
            launch = timeout_at(deadline, self.runtime.start(&self.spec)) => launch,
        };
        match launch {
            Ok(Ok(launch)) => debug!(?launch, "launched container"),
            Ok(Err(error)) => return Err(Error::Start(name.clone(), error)),
            Err(_) => return Err(Error::StartupTimeout(name.clone(), timeout)),
        }

        loop {
            let ready = select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled(name.clone())),
                ready = timeout_at(deadline, self.spec.readiness.check()) => ready,
            };
            match ready {
                Ok(Ok(true)) => {
                    info!("container ready");
                    return Ok(());
                }
                Ok(Ok(false)) => debug!("container not yet ready"),
                Ok(Err(error)) => debug!(%error, "readiness check failed"),
                Err(_) => return Err(Error::StartupTimeout(name.clone(), timeout)),
            }

            let wake_up = (Instant::now() + self.spec.poll_interval).min(deadline);
            select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled(name.clone())),
                _ = sleep_until(wake_up) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::StartupTimeout(name.clone(), timeout));
            }
        }
    }

    pub async fn state(&self) -> ContainerState {
        match self.runtime.is_running(&self.spec.name).await {
            Ok(false) => ContainerState::NotStarted,
            Ok(true) => match self.spec.readiness.check().await {
                Ok(true) => ContainerState::Healthy,
                _ => ContainerState::Starting,
            },
            Err(error) => {
                debug!(container = %self.spec.name, %error, "cannot query container");
                ContainerState::Failed
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("container {0} not ready within {1:?}")]
    StartupTimeout(String, Duration),

    #[error("cannot start container {0}")]
    Start(String, #[source] BoxError),

    #[error("starting container {0} was cancelled")]
    Cancelled(String),
}
