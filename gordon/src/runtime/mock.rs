//! In-memory runtime double for tests.
//!
//! Containers are plain records: `start` flips them to running,
//! addresses are loopback so probes can dial listeners the test opens.
//! Failure injection covers the paths the controller must survive:
//! daemon outage, denied pulls, missing images, start failures.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use gordon_common::ImageReference;

use super::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerView, RegistryAuth, RuntimeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullBehavior {
    Succeed,
    Deny,
    Missing,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, ContainerView>,
    /// `repo:tag` -> digest of the locally pulled image.
    images: HashMap<String, String>,
    networks: HashSet<String>,
    volumes: HashSet<String>,
    next_id: u64,
    /// Chronological `op:name` log for churn assertions.
    operations: Vec<String>,
}

struct MockBehavior {
    available: bool,
    pull: PullBehavior,
    fail_start_names: HashSet<String>,
    /// Digest served for `repo:tag` on pull.
    remote_digests: HashMap<String, String>,
    exposed_ports: Vec<u16>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            available: true,
            pull: PullBehavior::Succeed,
            fail_start_names: HashSet::new(),
            remote_digests: HashMap::new(),
            exposed_ports: vec![8080],
        }
    }
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    behavior: Mutex<MockBehavior>,
    list_calls: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.behavior.lock().unwrap().available {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("mock daemon down".into()))
        }
    }

    fn image_key(image: &ImageReference) -> String {
        format!("{}:{}", image.repository(), image.tag())
    }

    // Behavior knobs -----------------------------------------------------

    pub fn set_available(&self, available: bool) {
        self.behavior.lock().unwrap().available = available;
    }

    pub fn set_pull_behavior(&self, pull: PullBehavior) {
        self.behavior.lock().unwrap().pull = pull;
    }

    pub fn fail_start_of(&self, container_name: &str) {
        self.behavior
            .lock()
            .unwrap()
            .fail_start_names
            .insert(container_name.to_string());
    }

    pub fn set_remote_digest(&self, image: &ImageReference, digest: &str) {
        self.behavior
            .lock()
            .unwrap()
            .remote_digests
            .insert(Self::image_key(image), digest.to_string());
    }

    pub fn set_exposed_ports(&self, ports: Vec<u16>) {
        self.behavior.lock().unwrap().exposed_ports = ports;
    }

    /// Pre-seed a local image, as if pulled earlier.
    pub fn seed_image(&self, image: &ImageReference, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(Self::image_key(image), digest.to_string());
    }

    /// Pre-seed a container, as if a previous gordon process made it.
    pub fn seed_container(&self, view: ContainerView) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(view.id.clone(), view);
    }

    // Assertion helpers --------------------------------------------------

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|view| view.status.is_running())
            .map(|view| view.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|view| view.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn by_name(&self, name: &str) -> Option<ContainerView> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|view| view.name == name)
            .cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_available()
    }

    async fn list_managed(&self) -> Result<Vec<ContainerView>, RuntimeError> {
        self.check_available()?;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|view| view.is_managed())
            .cloned()
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerView>, RuntimeError> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().containers.get(id).cloned())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if state
            .containers
            .values()
            .any(|view| view.name == spec.name)
        {
            return Err(RuntimeError::Api(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let port = spec.container_port;
        state.operations.push(format!("create:{}", spec.name));
        state.containers.insert(
            id.clone(),
            ContainerView {
                id: id.clone(),
                name: spec.name,
                status: ContainerStatus::Created,
                labels: spec.labels,
                ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                exposed_ports: port.into_iter().collect(),
                published: match (spec.publish_loopback, port) {
                    (true, Some(port)) => vec![(port, port)],
                    _ => Vec::new(),
                },
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        let fail_names = self.behavior.lock().unwrap().fail_start_names.clone();
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if fail_names.contains(&container.name) {
            return Err(RuntimeError::Api(format!(
                "cannot start {}: injected failure",
                container.name
            )));
        }
        container.status = ContainerStatus::Running;
        let name = container.name.clone();
        state.operations.push(format!("start:{name}"));
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(id) {
            container.status = ContainerStatus::Exited;
            let name = container.name.clone();
            state.operations.push(format!("stop:{name}"));
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.remove(id) {
            state.operations.push(format!("remove:{}", container.name));
        }
        Ok(())
    }

    async fn pull(
        &self,
        image: &ImageReference,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        self.check_available()?;
        match self.behavior.lock().unwrap().pull {
            PullBehavior::Deny => {
                return Err(RuntimeError::Denied(format!("pull of {image} denied")))
            }
            PullBehavior::Missing => {
                return Err(RuntimeError::NotFound(format!("{image} not in registry")))
            }
            PullBehavior::Succeed => {}
        }
        let key = Self::image_key(image);
        let digest = self
            .behavior
            .lock()
            .unwrap()
            .remote_digests
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("sha256:{}", "0".repeat(64)));
        let mut state = self.state.lock().unwrap();
        state.operations.push(format!("pull:{key}"));
        state.images.insert(key, digest);
        Ok(())
    }

    async fn image_digest(
        &self,
        image: &ImageReference,
    ) -> Result<Option<String>, RuntimeError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .images
            .get(&Self::image_key(image))
            .cloned())
    }

    async fn image_exposed_ports(
        &self,
        image: &ImageReference,
    ) -> Result<Vec<u16>, RuntimeError> {
        self.check_available()?;
        let present = self
            .state
            .lock()
            .unwrap()
            .images
            .contains_key(&Self::image_key(image));
        if present {
            Ok(self.behavior.lock().unwrap().exposed_ports.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string());
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        self.state.lock().unwrap().volumes.insert(name.to_string());
        Ok(())
    }
}
