//! The runtime port: everything gordon asks of the local container
//! daemon goes through [`ContainerRuntime`]. The bollard-backed
//! implementation lives in [`docker`]; [`mock`] is the in-memory double
//! the tests drive.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use strum::Display;
use thiserror::Error;

use gordon_common::labels::{self, ManagedLabels};
use gordon_common::{DomainName, ImageReference};

use crate::{Error as CrateError, ErrorKind};

pub mod docker;
pub mod mock;

pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("registry denied access: {0}")]
    Denied(String),
    #[error("runtime api error: {0}")]
    Api(String),
}

impl From<RuntimeError> for CrateError {
    fn from(err: RuntimeError) -> Self {
        let kind = match &err {
            RuntimeError::Unavailable(_) => ErrorKind::RuntimeUnavailable,
            RuntimeError::NotFound(_) => ErrorKind::ImageNotFound,
            RuntimeError::Denied(_) => ErrorKind::PullDenied,
            RuntimeError::Api(_) => ErrorKind::Internal,
        };
        CrateError::source(kind, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// States the lifecycle monitor treats as crashed.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }

    /// States meaning a deployment may still be in flight for the
    /// container, so the monitor must not interfere.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Created | Self::Restarting | Self::Paused)
    }
}

/// Inspect-derived view of a container, as much of it as gordon reads.
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    /// Bridge-network address, when attached to one.
    pub ip: Option<IpAddr>,
    pub exposed_ports: Vec<u16>,
    /// `(container_port, host_port)` published mappings.
    pub published: Vec<(u16, u16)>,
}

impl ContainerView {
    pub fn managed(&self) -> Option<ManagedLabels> {
        ManagedLabels::parse(&self.labels)
    }

    pub fn is_managed(&self) -> bool {
        self.labels.get(labels::MANAGED).map(String::as_str) == Some("true")
    }

    /// Parent domains when this is an attachment container.
    pub fn attach_parents(&self) -> Option<BTreeSet<DomainName>> {
        let raw = self.labels.get(labels::ATTACH_PARENTS)?;
        Some(
            raw.split(',')
                .filter_map(|domain| domain.parse().ok())
                .collect(),
        )
    }

    /// The host port a container port was published to, if any.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.published
            .iter()
            .find(|(container, _)| *container == container_port)
            .map(|(_, host)| *host)
    }
}

/// What to run. Built by the deployment controller, consumed by the
/// runtime implementations.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageReference,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub network: Option<String>,
    /// DNS alias on the group network (`service.group.internal`).
    pub network_alias: Option<String>,
    /// `volume-name:/container/path` mounts.
    pub volumes: Vec<String>,
    pub container_port: Option<u16>,
    /// Publish `container_port` on a loopback host port instead of
    /// relying on bridge addressing.
    pub publish_loopback: bool,
}

/// Credentials for pulls against the co-hosted registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub server: String,
    pub token: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// All containers carrying `gordon.managed=true`, any state.
    async fn list_managed(&self) -> Result<Vec<ContainerView>, RuntimeError>;

    /// `None` when the container no longer exists.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerView>, RuntimeError>;

    async fn create(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    /// SIGTERM with `grace`, then SIGKILL.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pull(
        &self,
        image: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError>;
    /// Digest of the locally stored image, `None` when not present.
    async fn image_digest(&self, image: &ImageReference)
        -> Result<Option<String>, RuntimeError>;
    async fn image_exposed_ports(
        &self,
        image: &ImageReference,
    ) -> Result<Vec<u16>, RuntimeError>;

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

/// The running container currently serving a domain, highest
/// generation winning.
pub fn serving_container(
    containers: &[ContainerView],
    domain: &DomainName,
) -> Option<(ManagedLabels, ContainerView)> {
    containers
        .iter()
        .filter_map(|view| {
            let managed = view.managed()?;
            (managed.domain == *domain && view.status.is_running())
                .then(|| (managed, view.clone()))
        })
        .max_by_key(|(managed, _)| managed.generation)
}
