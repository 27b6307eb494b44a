//! The config store: sole owner of the route table.
//!
//! The TOML file is read at startup and watched by mtime polling.
//! Memory is the source of truth: the watcher adds and updates routes
//! from the file but never removes one; removals happen through the
//! API or an explicit full reload (`gordon reload` / SIGUSR1). Readers
//! get cheap copy-on-write snapshots; all writes serialise through one
//! lock and persist back to the file atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gordon_common::models::{Attachment, NetworkGroup, Route};
use gordon_common::DomainName;

use crate::bus::{Event, EventBus};
use crate::health::ProbeMode;
use crate::{Error, ErrorKind};

const WATCH_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Targets are container bridge addresses; no host ports published.
    #[default]
    Bridge,
    /// Targets are loopback host ports published by the runtime.
    HostPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfTagChanged,
    IfMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub proxy_addr: SocketAddr,
    pub registry_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub runtime_dir: PathBuf,
    pub network_mode: NetworkMode,
    /// Address the runtime pulls from when deploying images pushed to
    /// the co-hosted registry.
    pub registry_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_addr: "0.0.0.0:8080".parse().expect("valid default addr"),
            registry_addr: "127.0.0.1:5000".parse().expect("valid default addr"),
            control_addr: "127.0.0.1:8008".parse().expect("valid default addr"),
            runtime_dir: PathBuf::from("/var/lib/gordon"),
            network_mode: NetworkMode::Bridge,
            registry_host: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    pub enabled: bool,
    /// Overridden by `GORDON_AUTH_TOKEN_SECRET`.
    pub jwt_secret: Option<String>,
    pub users: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeployConfig {
    pub pull_policy: PullPolicy,
    pub treat_latest_as_mutable: bool,
    pub auto_route: bool,
    pub auto_start: bool,
    pub drain_grace_secs: u64,
    pub stop_grace_secs: u64,
    pub probe_mode: ProbeMode,
    pub probe_path: String,
    pub probe_timeout_secs: u64,
    pub lock_timeout_ms: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            pull_policy: PullPolicy::IfTagChanged,
            treat_latest_as_mutable: true,
            auto_route: false,
            auto_start: true,
            drain_grace_secs: 30,
            stop_grace_secs: 10,
            probe_mode: ProbeMode::Auto,
            probe_path: "/".to_string(),
            probe_timeout_secs: 90,
            lock_timeout_ms: 5000,
        }
    }
}

/// A route as written in the file; the domain is the table key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouteConfig {
    pub image: gordon_common::ImageReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub attachments: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_group: Option<String>,
}

impl RouteConfig {
    fn into_route(self, domain: DomainName) -> Route {
        Route {
            domain,
            image: self.image,
            port: self.port,
            attachments: self.attachments,
            network_group: self.network_group,
        }
    }

    fn from_route(route: &Route) -> Self {
        Self {
            image: route.image.clone(),
            port: route.port,
            attachments: route.attachments.clone(),
            network_group: route.network_group.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GordonConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub deploy: DeployConfig,
    pub routes: BTreeMap<DomainName, RouteConfig>,
    pub network_groups: BTreeMap<String, NetworkGroup>,
    pub attachments: BTreeMap<String, Attachment>,
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub deploy: DeployConfig,
    pub routes: BTreeMap<DomainName, Route>,
    pub network_groups: BTreeMap<String, NetworkGroup>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl Snapshot {
    fn from_config(config: GordonConfig) -> Self {
        let routes = config
            .routes
            .into_iter()
            .map(|(domain, route)| (domain.clone(), route.into_route(domain)))
            .collect();
        Self {
            server: config.server,
            auth: config.auth,
            deploy: config.deploy,
            routes,
            network_groups: config.network_groups,
            attachments: config.attachments,
        }
    }

    fn to_config(&self) -> GordonConfig {
        GordonConfig {
            server: self.server.clone(),
            auth: self.auth.clone(),
            deploy: self.deploy.clone(),
            routes: self
                .routes
                .iter()
                .map(|(domain, route)| (domain.clone(), RouteConfig::from_route(route)))
                .collect(),
            network_groups: self.network_groups.clone(),
            attachments: self.attachments.clone(),
        }
    }

    pub fn route(&self, domain: &DomainName) -> Option<&Route> {
        self.routes.get(domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// What the file watcher runs: add and update, never remove.
    AddOnly,
    /// What SIGUSR1 / `gordon reload` runs: full sync with the file,
    /// removals included.
    Full,
}

pub struct ConfigStore {
    path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    write_lock: tokio::sync::Mutex<()>,
    bus: OnceCell<Arc<EventBus>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => GordonConfig::default(),
            Err(err) => return Err(Error::source(ErrorKind::ConfigInvalid, err)),
        };
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(Snapshot::from_config(config))),
            write_lock: tokio::sync::Mutex::new(()),
            bus: OnceCell::new(),
        })
    }

    /// The bus is built after the store; wire it in before starting the
    /// watcher.
    pub fn attach_bus(&self, bus: Arc<EventBus>) {
        let _ = self.bus.set(bus);
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().expect("config lock poisoned"))
    }

    pub fn route(&self, domain: &DomainName) -> Option<Route> {
        self.snapshot().route(domain).cloned()
    }

    fn swap_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write().expect("config lock poisoned") = Arc::new(snapshot);
    }

    /// Insert a route if absent. Returns whether it was added.
    pub async fn add_route(&self, route: Route) -> Result<bool, Error> {
        let _guard = self.write_lock.lock().await;
        let current = self.snapshot();
        if current.routes.contains_key(&route.domain) {
            return Ok(false);
        }
        let domain = route.domain.clone();
        let mut next = (*current).clone();
        next.routes.insert(domain.clone(), route);
        self.swap_snapshot(next);
        self.persist().await?;
        self.emit([domain].into()).await;
        Ok(true)
    }

    pub async fn update_route(&self, route: Route) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let domain = route.domain.clone();
        let mut next = (*self.snapshot()).clone();
        next.routes.insert(domain.clone(), route);
        self.swap_snapshot(next);
        self.persist().await?;
        self.emit([domain].into()).await;
        Ok(())
    }

    pub async fn remove_route(&self, domain: &DomainName) -> Result<bool, Error> {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot()).clone();
        let removed = next.routes.remove(domain).is_some();
        if removed {
            self.swap_snapshot(next);
            self.persist().await?;
            self.emit([domain.clone()].into()).await;
        }
        Ok(removed)
    }

    /// Re-read the file and merge. Returns the touched domain set.
    pub async fn reload(&self, mode: ReloadMode) -> Result<BTreeSet<DomainName>, Error> {
        let _guard = self.write_lock.lock().await;
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(Error::source(ErrorKind::ConfigInvalid, err)),
        };
        let file: GordonConfig =
            toml::from_str(&raw).map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?;
        let file = Snapshot::from_config(file);

        let current = self.snapshot();
        let mut next = (*current).clone();
        let mut touched = BTreeSet::new();

        for (domain, route) in &file.routes {
            if next.routes.get(domain) != Some(route) {
                next.routes.insert(domain.clone(), route.clone());
                touched.insert(domain.clone());
            }
        }
        if mode == ReloadMode::Full {
            let removed: Vec<DomainName> = next
                .routes
                .keys()
                .filter(|domain| !file.routes.contains_key(*domain))
                .cloned()
                .collect();
            for domain in removed {
                next.routes.remove(&domain);
                touched.insert(domain);
            }
        }

        // Non-route sections follow the file on every reload; a changed
        // server section takes effect on the next start.
        next.auth = file.auth;
        next.deploy = file.deploy;
        next.network_groups = file.network_groups;
        next.attachments = file.attachments;

        self.swap_snapshot(next);
        if !touched.is_empty() {
            self.emit(touched.clone()).await;
        }
        Ok(touched)
    }

    /// Poll the file's mtime and fold changes in, add/update only.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let mut last = file_mtime(&self.path).await;
        let mut ticker = tokio::time::interval(WATCH_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let now = file_mtime(&self.path).await;
            if now == last {
                continue;
            }
            last = now;
            match self.reload(ReloadMode::AddOnly).await {
                Ok(touched) if !touched.is_empty() => {
                    info!(domains = ?touched, "config file changed");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "config file reload failed"),
            }
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        let config = self.snapshot().to_config();
        let raw = toml::to_string_pretty(&config)
            .map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("toml.staging");
        tokio::fs::write(&staging, raw).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn emit(&self, domains: BTreeSet<DomainName>) {
        if let Some(bus) = self.bus.get() {
            if let Err(err) = bus.publish(Event::ConfigReload { domains }).await {
                warn!(%err, "dropping config-reload event");
            }
        }
    }
}

async fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
proxy-addr = "0.0.0.0:80"
network-mode = "bridge"

[auth]
enabled = true

[deploy]
pull-policy = "if-tag-changed"
auto-route = true
drain-grace-secs = 5

[routes."app.example.com"]
image = "myapp:latest"
port = 8080
attachments = ["db"]
network-group = "apps"

[network-groups.apps]
members = ["app.example.com"]

[attachments.db]
image = "postgres:16"
volumes = ["db-data:/var/lib/postgresql/data"]
"#;

    async fn store_with(content: &str) -> (tempfile::TempDir, Arc<ConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        tokio::fs::write(&path, content).await.unwrap();
        let store = Arc::new(ConfigStore::load(&path).await.unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn parses_sample_config() {
        let (_dir, store) = store_with(SAMPLE).await;
        let snapshot = store.snapshot();

        assert!(snapshot.auth.enabled);
        assert!(snapshot.deploy.auto_route);
        assert_eq!(snapshot.deploy.drain_grace_secs, 5);
        assert_eq!(snapshot.deploy.pull_policy, PullPolicy::IfTagChanged);

        let route = snapshot
            .route(&"app.example.com".parse().unwrap())
            .unwrap();
        assert_eq!(route.image.to_string(), "myapp:latest");
        assert_eq!(route.port, Some(8080));
        assert!(route.attachments.contains("db"));
        assert_eq!(route.network_group.as_deref(), Some("apps"));
        assert!(snapshot.attachments.contains_key("db"));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("missing.toml"))
            .await
            .unwrap();
        assert!(store.snapshot().routes.is_empty());
        assert_eq!(store.snapshot().deploy.probe_timeout_secs, 90);
    }

    #[tokio::test]
    async fn invalid_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        tokio::fs::write(&path, "routes = 42").await.unwrap();
        let err = ConfigStore::load(&path).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn add_route_persists_and_is_idempotent() {
        let (_dir, store) = store_with("").await;
        let route = Route::new(
            "new.example.com".parse().unwrap(),
            "newapp:latest".parse().unwrap(),
        );

        assert!(store.add_route(route.clone()).await.unwrap());
        assert!(!store.add_route(route.clone()).await.unwrap());

        // A fresh store reads the persisted route back.
        let reopened = ConfigStore::load(&store.path).await.unwrap();
        assert_eq!(
            reopened.route(&route.domain).unwrap().image,
            route.image
        );
    }

    #[tokio::test]
    async fn add_only_reload_never_removes() {
        let (_dir, store) = store_with(SAMPLE).await;
        let domain: DomainName = "app.example.com".parse().unwrap();

        // The file loses the route; the watcher-style reload keeps it.
        tokio::fs::write(&store.path, "").await.unwrap();
        let touched = store.reload(ReloadMode::AddOnly).await.unwrap();
        assert!(touched.is_empty());
        assert!(store.route(&domain).is_some());

        // The explicit full reload removes it and reports the domain.
        let touched = store.reload(ReloadMode::Full).await.unwrap();
        assert_eq!(touched, BTreeSet::from([domain.clone()]));
        assert!(store.route(&domain).is_none());
    }

    #[tokio::test]
    async fn reload_picks_up_new_and_changed_routes() {
        let (_dir, store) = store_with(SAMPLE).await;
        let updated = r#"
[routes."app.example.com"]
image = "myapp:2.0"

[routes."new.example.com"]
image = "other:latest"
"#;
        tokio::fs::write(&store.path, updated).await.unwrap();
        let touched = store.reload(ReloadMode::AddOnly).await.unwrap();
        assert_eq!(touched.len(), 2);
        assert_eq!(
            store
                .route(&"app.example.com".parse().unwrap())
                .unwrap()
                .image
                .to_string(),
            "myapp:2.0"
        );
        assert!(store.route(&"new.example.com".parse().unwrap()).is_some());
    }
}
