//! Bollard-backed implementation of the runtime port.

use std::collections::HashMap;
use std::time::Duration;

use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, HostConfig, PortBinding,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::TryStreamExt;
use tracing::{debug, trace};

use async_trait::async_trait;
use gordon_common::labels;
use gordon_common::ImageReference;

use super::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerView, RegistryAuth, RuntimeError,
};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_err(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeError::NotFound(message),
            401 | 403 => RuntimeError::Denied(message),
            _ => RuntimeError::Api(message),
        },
        // Everything that is not an API-level response is treated as
        // the daemon being unreachable; the controller's bounded retry
        // and the monitor pick it up from there.
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn parse_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Exited,
    }
}

fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

fn view_from_inspect(inspect: ContainerInspectResponse) -> Result<ContainerView, RuntimeError> {
    let id = inspect
        .id
        .ok_or_else(|| RuntimeError::Api("container inspect response without id".into()))?;
    let name = inspect
        .name
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let status = parse_status(inspect.state.and_then(|state| state.status));

    let config = inspect.config.unwrap_or_default();
    let labels = config.labels.unwrap_or_default();
    let exposed_ports = config
        .exposed_ports
        .unwrap_or_default()
        .keys()
        .filter_map(|key| parse_port_key(key))
        .collect();

    let network_settings = inspect.network_settings.unwrap_or_default();
    let ip = network_settings
        .networks
        .as_ref()
        .and_then(|networks| networks.values().next())
        .and_then(|endpoint| endpoint.ip_address.as_deref())
        .and_then(|ip| ip.parse().ok());
    let published = network_settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, bindings)| {
            let container_port = parse_port_key(&key)?;
            let host_port = bindings?
                .into_iter()
                .find_map(|binding| binding.host_port?.parse().ok())?;
            Some((container_port, host_port))
        })
        .collect();

    Ok(ContainerView {
        id,
        name,
        status,
        labels,
        ip,
        exposed_ports,
        published,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerView>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", labels::MANAGED)],
        )]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        let mut views = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            // Inspect for the full view; a container that vanished
            // between list and inspect is simply skipped.
            if let Some(view) = self.inspect(&id).await? {
                views.push(view);
            }
        }
        Ok(views)
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerView>, RuntimeError> {
        match self.docker.inspect_container(id, None).await {
            Ok(inspect) => Ok(Some(view_from_inspect(inspect)?)),
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let exposed_ports = spec.container_port.map(|port| {
            HashMap::from([(format!("{port}/tcp"), HashMap::new())])
        });

        let port_bindings = match (spec.publish_loopback, spec.container_port) {
            (true, Some(port)) => Some(HashMap::from([(
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    // An empty host port lets the daemon pick a free one.
                    host_port: Some(String::new()),
                }]),
            )])),
            _ => None,
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(
                network.clone(),
                EndpointSettings {
                    aliases: spec.network_alias.clone().map(|alias| vec![alias]),
                    ..Default::default()
                },
            )]),
        });

        let config = Config {
            image: Some(spec.image.to_string()),
            env: Some(spec.env),
            labels: Some(spec.labels.into_iter().collect()),
            exposed_ports,
            host_config: Some(HostConfig {
                binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
                port_bindings,
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        };

        trace!(name = %spec.name, image = %spec.image, "creating container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_err)?;
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self.docker.start_container::<String>(id, None).await {
            Ok(()) => Ok(()),
            // 304: already started.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn pull(
        &self,
        image: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let credentials = auth.map(|auth| DockerCredentials {
            serveraddress: Some(auth.server.clone()),
            registrytoken: Some(auth.token.clone()),
            ..Default::default()
        });

        debug!(%image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.repository().to_string(),
                    tag: image.tag().to_string(),
                    ..Default::default()
                }),
                None,
                credentials,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn image_digest(
        &self,
        image: &ImageReference,
    ) -> Result<Option<String>, RuntimeError> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(inspect) => {
                let from_repo = inspect.repo_digests.as_ref().and_then(|digests| {
                    digests
                        .iter()
                        .find_map(|entry| entry.split_once('@').map(|(_, digest)| digest.to_string()))
                });
                Ok(from_repo.or(inspect.id))
            }
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn image_exposed_ports(
        &self,
        image: &ImageReference,
    ) -> Result<Vec<u16>, RuntimeError> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(inspect) => Ok(inspect
                .config
                .and_then(|config| config.exposed_ports)
                .unwrap_or_default()
                .keys()
                .filter_map(|key| parse_port_key(key))
                .collect()),
            Err(err) => match map_err(err) {
                RuntimeError::NotFound(_) => Ok(Vec::new()),
                other => Err(other),
            },
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            // 409: the network already exists, which is the goal.
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
