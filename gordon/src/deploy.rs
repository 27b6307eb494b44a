//! The deployment controller and its zero-downtime swap.
//!
//! One deployment runs per domain at a time; domains proceed in
//! parallel. A deployment that cannot finish never touches what is
//! serving: the new container is created, started, and probed beside
//! the old one, and only the resolver cache flip commits the swap. The
//! displaced container then drains in the background before it is
//! stopped and removed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strum::Display;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gordon_common::labels::{self, ManagedLabels};
use gordon_common::models::Route;
use gordon_common::{DomainName, ImageReference};

use crate::bus::{Event, EventBus};
use crate::config::{ConfigStore, NetworkMode, PullPolicy, Snapshot};
use crate::envstore::EnvStore;
use crate::health::{self, ProbeMode};
use crate::resolver::{ResolvedTarget, Resolver};
use crate::runtime::{
    serving_container, ContainerRuntime, ContainerSpec, ContainerView, RegistryAuth, RuntimeError,
};
use crate::telemetry::{bump, Counters};
use crate::{Error, ErrorKind};

const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_RUNTIME_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeployReason {
    Push,
    Manual,
    Reload,
    AutoStart,
    Monitor,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub domain: DomainName,
    pub image: ImageReference,
    pub reason: DeployReason,
    /// Manifest digest the caller believes the reference points at;
    /// set by push-triggered deploys.
    pub expected_digest: Option<String>,
    /// Port carried by a `gordon.port` push annotation.
    pub port_hint: Option<u16>,
}

impl DeployRequest {
    pub fn new(domain: DomainName, image: ImageReference, reason: DeployReason) -> Self {
        Self {
            domain,
            image,
            reason,
            expected_digest: None,
            port_hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed {
        container_id: String,
        generation: u64,
    },
    /// The running container already serves the requested image.
    NoOp,
}

/// What the registry knows about a tag right now. Lets the controller
/// notice a tag that moved between plan and prepare.
#[async_trait]
pub trait DigestLookup: Send + Sync {
    async fn digest_for(&self, name: &str, tag: &str) -> Option<String>;
}

/// Catalog for setups without a reachable registry index.
pub struct NoCatalog;

#[async_trait]
impl DigestLookup for NoCatalog {
    async fn digest_for(&self, _name: &str, _tag: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub pull_policy: PullPolicy,
    pub treat_latest_as_mutable: bool,
    pub drain_grace: Duration,
    pub stop_grace: Duration,
    pub probe_mode: ProbeMode,
    pub probe_path: String,
    pub probe_timeout: Duration,
    pub lock_timeout: Duration,
    pub network_mode: NetworkMode,
}

impl DeploySettings {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let deploy = &snapshot.deploy;
        Self {
            pull_policy: deploy.pull_policy,
            treat_latest_as_mutable: deploy.treat_latest_as_mutable,
            drain_grace: Duration::from_secs(deploy.drain_grace_secs),
            stop_grace: Duration::from_secs(deploy.stop_grace_secs),
            probe_mode: deploy.probe_mode,
            probe_path: deploy.probe_path.clone(),
            probe_timeout: Duration::from_secs(deploy.probe_timeout_secs),
            lock_timeout: Duration::from_millis(deploy.lock_timeout_ms),
            network_mode: snapshot.server.network_mode,
        }
    }
}

/// Per-domain swap generation counters. Seeded from the label scan,
/// advanced only when a swap commits; never lowered.
#[derive(Default)]
struct Generations {
    counters: Mutex<HashMap<DomainName, Arc<AtomicU64>>>,
}

impl Generations {
    fn counter(&self, domain: &DomainName) -> Arc<AtomicU64> {
        self.counters
            .lock()
            .expect("generation table poisoned")
            .entry(domain.clone())
            .or_default()
            .clone()
    }

    /// Raise the counter to what the runtime's labels show.
    fn observe(&self, domain: &DomainName, generation: u64) {
        self.counter(domain).fetch_max(generation, Ordering::SeqCst);
    }

    fn current(&self, domain: &DomainName) -> u64 {
        self.counter(domain).load(Ordering::SeqCst)
    }

    /// The commit-point advance.
    fn commit(&self, domain: &DomainName, generation: u64) {
        self.counter(domain).fetch_max(generation, Ordering::SeqCst);
    }
}

pub struct Deployer {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ConfigStore>,
    resolver: Arc<Resolver>,
    bus: Arc<EventBus>,
    env: Arc<EnvStore>,
    catalog: Arc<dyn DigestLookup>,
    registry_auth: Option<RegistryAuth>,
    counters: Arc<Counters>,
    generations: Generations,
    locks: Mutex<HashMap<DomainName, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<HashMap<DomainName, DeployRequest>>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicUsize,
    cancel: CancellationToken,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<ConfigStore>,
        resolver: Arc<Resolver>,
        bus: Arc<EventBus>,
        env: Arc<EnvStore>,
        catalog: Arc<dyn DigestLookup>,
        registry_auth: Option<RegistryAuth>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            resolver,
            bus,
            env,
            catalog,
            registry_auth,
            counters,
            generations: Generations::default(),
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            drains: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            cancel,
        })
    }

    pub(crate) fn domain_lock(&self, domain: &DomainName) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("deploy lock table poisoned")
            .entry(domain.clone())
            .or_default()
            .clone()
    }

    /// Synchronous deploy path (CLI, control API): waits for the
    /// domain lock up to the configured timeout, then reports `Busy`.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployOutcome, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::from_kind(ErrorKind::Cancelled));
        }
        let settings = DeploySettings::from_snapshot(&self.config.snapshot());
        let lock = self.domain_lock(&request.domain);
        let guard = tokio::time::timeout(settings.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                Error::custom(
                    ErrorKind::Busy,
                    format!("a deployment for {} is already in flight", request.domain),
                )
            })?;
        self.run_locked(request, guard).await
    }

    /// Event-driven deploy path (push, reload, monitor, auto-start):
    /// never blocks the caller. While a deployment for the domain is in
    /// flight, requests collapse into a single latest-wins slot.
    pub fn submit(self: &Arc<Self>, request: DeployRequest) {
        if self.cancel.is_cancelled() {
            warn!(domain = %request.domain, "refusing deployment, shutting down");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let domain = request.domain.clone();
            {
                let mut pending = this.pending.lock().expect("pending slot lock poisoned");
                if pending.insert(domain.clone(), request).is_some() {
                    bump(&this.counters.deploys_coalesced);
                }
            }
            loop {
                let lock = this.domain_lock(&domain);
                let Ok(guard) = lock.try_lock_owned() else {
                    // The active deployment drains the slot on its way out.
                    return;
                };
                let next = this
                    .pending
                    .lock()
                    .expect("pending slot lock poisoned")
                    .remove(&domain);
                let Some(next) = next else { return };
                if let Err(err) = this.run_locked(next, guard).await {
                    warn!(%domain, %err, "deployment failed");
                }
                // Re-check: a request may have landed in the slot while
                // the guard was being released.
                let empty = !this
                    .pending
                    .lock()
                    .expect("pending slot lock poisoned")
                    .contains_key(&domain);
                if empty {
                    return;
                }
            }
        });
    }

    async fn run_locked(
        &self,
        request: DeployRequest,
        guard: OwnedMutexGuard<()>,
    ) -> Result<DeployOutcome, Error> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let domain = request.domain.clone();
        let mut current = request;
        let mut first = None;

        loop {
            let result = self.execute(current).await;
            match &result {
                Ok(DeployOutcome::Deployed { generation, .. }) => {
                    bump(&self.counters.deploys_committed);
                    info!(%domain, generation, "deployment committed");
                }
                Ok(DeployOutcome::NoOp) => debug!(%domain, "deployment was a no-op"),
                Err(err) => {
                    bump(&self.counters.deploys_failed);
                    warn!(%domain, kind = %err.kind(), %err, "deployment failed");
                }
            }
            if first.is_none() {
                first = Some(result);
            }

            let next = self
                .pending
                .lock()
                .expect("pending slot lock poisoned")
                .remove(&domain);
            match next {
                Some(next) if !self.cancel.is_cancelled() => current = next,
                _ => break,
            }
        }

        drop(guard);
        self.active.fetch_sub(1, Ordering::SeqCst);
        first.expect("deploy loop ran at least once")
    }

    /// One swap attempt, per the protocol: plan, prepare, create,
    /// start, probe, commit, drain.
    async fn execute(&self, request: DeployRequest) -> Result<DeployOutcome, Error> {
        bump(&self.counters.deploys_started);
        let domain = request.domain.clone();
        let image = request.image.clone();
        let settings = DeploySettings::from_snapshot(&self.config.snapshot());
        info!(%domain, %image, reason = %request.reason, "deploying");

        let mut expected_digest = request.expected_digest.clone();
        let mut replanned = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::from_kind(ErrorKind::Cancelled));
            }

            // Plan: is there anything to do, and does the image need
            // pulling?
            let route = self
                .config
                .route(&domain)
                .ok_or_else(|| Error::from_kind(ErrorKind::RouteUnknown))?;
            let containers = self.list_with_retry().await?;
            let current = serving_container(&containers, &domain);

            let local_digest = self.runtime.image_digest(&image).await.ok().flatten();
            if let Some((running_labels, _)) = &current {
                if running_labels.image == image {
                    match (&expected_digest, &local_digest) {
                        (None, _) => {
                            debug!(%domain, "running container already serves {image}");
                            return Ok(DeployOutcome::NoOp);
                        }
                        // Only trustworthy before this attempt pulled
                        // anything: a replan means the running container
                        // predates the digest now held locally.
                        (Some(expected), Some(local)) if expected == local && !replanned => {
                            debug!(%domain, "pushed digest is already deployed");
                            return Ok(DeployOutcome::NoOp);
                        }
                        _ => {}
                    }
                }
            }
            let should_pull = match settings.pull_policy {
                PullPolicy::Always => true,
                PullPolicy::IfMissing => local_digest.is_none(),
                PullPolicy::IfTagChanged => {
                    if image.tag() == "latest" && settings.treat_latest_as_mutable {
                        true
                    } else {
                        let remote = match &expected_digest {
                            Some(digest) => Some(digest.clone()),
                            None => {
                                self.catalog
                                    .digest_for(image.short_name(), image.tag())
                                    .await
                            }
                        };
                        match (&local_digest, &remote) {
                            (Some(local), Some(remote)) => local != remote,
                            (None, _) => true,
                            (Some(_), None) => false,
                        }
                    }
                }
            };

            // Prepare: pull with the service credential.
            if should_pull {
                match self.runtime.pull(&image, self.registry_auth.as_ref()).await {
                    Ok(()) => {}
                    Err(RuntimeError::Denied(reason)) => {
                        return Err(Error::custom(ErrorKind::PullDenied, reason))
                    }
                    Err(RuntimeError::NotFound(reason)) => {
                        return Err(Error::custom(ErrorKind::ImageNotFound, reason))
                    }
                    Err(err) => {
                        if local_digest.is_some()
                            && settings.pull_policy == PullPolicy::IfTagChanged
                        {
                            warn!(%domain, %err, "pull failed, deploying the locally cached image");
                        } else {
                            return Err(Error::source(ErrorKind::PullFailed, err));
                        }
                    }
                }
            }

            // The tag may have been re-pushed since this request was
            // enqueued; replan once against the newer digest.
            if let Some(expected) = &expected_digest {
                if let Some(now) = self
                    .catalog
                    .digest_for(image.short_name(), image.tag())
                    .await
                {
                    if &now != expected && !replanned {
                        replanned = true;
                        info!(%domain, "tag moved during prepare, replanning");
                        expected_digest = Some(now);
                        continue;
                    }
                }
            }

            return self
                .swap(&request, &route, containers, current, &settings)
                .await;
        }
    }

    async fn swap(
        &self,
        request: &DeployRequest,
        route: &Route,
        containers: Vec<ContainerView>,
        current: Option<(ManagedLabels, ContainerView)>,
        settings: &DeploySettings,
    ) -> Result<DeployOutcome, Error> {
        let domain = &request.domain;
        let image = &request.image;

        let exposed = self
            .runtime
            .image_exposed_ports(image)
            .await
            .unwrap_or_default();
        let container_port = route
            .port
            .or(request.port_hint)
            .or_else(|| exposed.first().copied())
            .ok_or_else(|| {
                Error::custom(
                    ErrorKind::CreateFailed,
                    "no target port: the image exposes none and the route names none",
                )
            })?;

        // The per-domain atomic is authoritative for generations; the
        // label scan only raises it, so a counter survives containers
        // that vanished outside a committed swap.
        for view in &containers {
            if let Some(managed) = view.managed() {
                if managed.domain == *domain {
                    self.generations.observe(domain, managed.generation);
                }
            }
        }
        let next_generation = self.generations.current(domain) + 1;

        let network = match &route.network_group {
            Some(group) => {
                let name = format!("gordon-{group}");
                self.runtime
                    .ensure_network(&name)
                    .await
                    .map_err(|err| Error::source(ErrorKind::CreateFailed, err))?;
                Some(name)
            }
            None => None,
        };
        self.ensure_attachments(route, network.as_deref()).await?;

        let env = self.env.load(domain).await;
        let spec = ContainerSpec {
            name: domain.container_name(next_generation),
            image: image.clone(),
            labels: ManagedLabels::new(domain.clone(), image.clone(), next_generation)
                .with_port(Some(container_port))
                .encode(),
            env,
            network,
            network_alias: route.network_group.as_ref().and_then(|group| {
                let service = domain.as_str().split('.').next()?;
                Some(format!("{service}.{group}.internal"))
            }),
            volumes: Vec::new(),
            container_port: Some(container_port),
            publish_loopback: settings.network_mode == NetworkMode::HostPort,
        };

        // Create.
        let new_id = self.runtime.create(spec).await.map_err(|err| match err {
            RuntimeError::Unavailable(reason) => {
                Error::custom(ErrorKind::RuntimeUnavailable, reason)
            }
            other => Error::source(ErrorKind::CreateFailed, other),
        })?;

        // Start. On failure the created container is removed and the
        // prior one keeps serving.
        if let Err(err) = self.runtime.start(&new_id).await {
            self.runtime.remove(&new_id).await.ok();
            return Err(match err {
                RuntimeError::Unavailable(reason) => {
                    Error::custom(ErrorKind::RuntimeUnavailable, reason)
                }
                other => Error::source(ErrorKind::StartFailed, other),
            });
        }

        // Readiness.
        if let Err(err) = self.await_ready(&new_id, container_port, settings).await {
            self.runtime.stop(&new_id, Duration::from_secs(1)).await.ok();
            self.runtime.remove(&new_id).await.ok();
            return Err(err);
        }

        if self.cancel.is_cancelled() {
            // A cancelled swap must not leave the uncommitted container
            // behind.
            self.runtime.stop(&new_id, Duration::from_secs(1)).await.ok();
            self.runtime.remove(&new_id).await.ok();
            return Err(Error::from_kind(ErrorKind::Cancelled));
        }

        // Commit: the cache flip is the point of no return. Strictly
        // write-cache, publish, then drain-and-stop the predecessor.
        let Some(target) = self.target_for(&new_id, container_port, settings).await else {
            self.runtime.stop(&new_id, Duration::from_secs(1)).await.ok();
            self.runtime.remove(&new_id).await.ok();
            return Err(Error::custom(
                ErrorKind::Unhealthy,
                "new container has no routable address",
            ));
        };
        let target = ResolvedTarget {
            generation: next_generation,
            ..target
        };
        self.resolver.commit_target(domain, target);
        self.generations.commit(domain, next_generation);

        if let Err(err) = self
            .bus
            .publish(Event::ContainerDeployed {
                domain: domain.clone(),
                container_id: new_id.clone(),
            })
            .await
        {
            warn!(%domain, %err, "container-deployed event dropped");
        }

        if let Some((_, old)) = current {
            self.spawn_drain(domain.clone(), old, settings);
        }

        // Exited predecessors left by crashes or failed swaps go with
        // the committed swap.
        for view in &containers {
            if let Some(managed) = view.managed() {
                if managed.domain == *domain
                    && managed.generation < next_generation
                    && view.status.is_down()
                {
                    self.runtime.remove(&view.id).await.ok();
                }
            }
        }

        Ok(DeployOutcome::Deployed {
            container_id: new_id,
            generation: next_generation,
        })
    }

    async fn await_ready(
        &self,
        id: &str,
        container_port: u16,
        settings: &DeploySettings,
    ) -> Result<(), Error> {
        if settings.probe_mode == ProbeMode::None {
            return Ok(());
        }
        let addr = self
            .probe_addr(id, container_port, settings)
            .await
            .ok_or_else(|| {
                Error::custom(ErrorKind::Unhealthy, "started container has no probe address")
            })?;
        match health::probe(
            addr,
            settings.probe_mode,
            &settings.probe_path,
            settings.probe_timeout,
            &self.cancel,
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(unready) => {
                bump(&self.counters.probes_failed);
                if self.cancel.is_cancelled() {
                    Err(Error::from_kind(ErrorKind::Cancelled))
                } else {
                    Err(Error::custom(ErrorKind::Unhealthy, unready.to_string()))
                }
            }
        }
    }

    async fn probe_addr(
        &self,
        id: &str,
        container_port: u16,
        settings: &DeploySettings,
    ) -> Option<SocketAddr> {
        let target = self.target_for(id, container_port, settings).await?;
        Some(SocketAddr::new(target.host, target.port))
    }

    async fn target_for(
        &self,
        id: &str,
        container_port: u16,
        settings: &DeploySettings,
    ) -> Option<ResolvedTarget> {
        let view = self.runtime.inspect(id).await.ok().flatten()?;
        match settings.network_mode {
            NetworkMode::Bridge => Some(ResolvedTarget {
                host: view.ip?,
                port: container_port,
                container_id: view.id,
                generation: 0,
            }),
            NetworkMode::HostPort => Some(ResolvedTarget {
                host: std::net::IpAddr::from([127, 0, 0, 1]),
                port: view.host_port_for(container_port)?,
                container_id: view.id,
                generation: 0,
            }),
        }
    }

    fn spawn_drain(&self, domain: DomainName, old: ContainerView, settings: &DeploySettings) {
        let runtime = Arc::clone(&self.runtime);
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.clone();
        let drain_grace = settings.drain_grace;
        let stop_grace = settings.stop_grace;

        let handle = tokio::spawn(async move {
            debug!(%domain, container = %old.name, "draining displaced container");
            tokio::select! {
                _ = tokio::time::sleep(drain_grace) => {}
                // Shutdown cuts the grace period short.
                _ = cancel.cancelled() => {}
            }
            if let Err(err) = runtime.stop(&old.id, stop_grace).await {
                warn!(%domain, %err, "failed to stop drained container");
            }
            if let Err(err) = runtime.remove(&old.id).await {
                warn!(%domain, %err, "failed to remove drained container");
            }
            let _ = bus
                .publish(Event::ContainerRemoved {
                    domain,
                    container_id: old.id,
                })
                .await;
        });
        self.drains
            .lock()
            .expect("drain table lock poisoned")
            .push(handle);
    }

    async fn ensure_attachments(
        &self,
        route: &Route,
        network: Option<&str>,
    ) -> Result<(), Error> {
        if route.attachments.is_empty() {
            return Ok(());
        }
        let snapshot = self.config.snapshot();
        let existing = self.list_with_retry().await?;

        for name in &route.attachments {
            let Some(attachment) = snapshot.attachments.get(name) else {
                warn!(attachment = %name, "route references an undefined attachment");
                continue;
            };
            let container_name = format!("gordon-attach-{name}");

            if let Some(view) = existing.iter().find(|view| view.name == container_name) {
                if view.status.is_running() {
                    continue;
                }
                self.runtime
                    .start(&view.id)
                    .await
                    .map_err(|err| Error::source(ErrorKind::CreateFailed, err))?;
                continue;
            }

            for volume in &attachment.volumes {
                if let Some(volume_name) = volume.split(':').next() {
                    self.runtime
                        .ensure_volume(volume_name)
                        .await
                        .map_err(|err| Error::source(ErrorKind::CreateFailed, err))?;
                }
            }
            if self
                .runtime
                .image_digest(&attachment.image)
                .await
                .ok()
                .flatten()
                .is_none()
            {
                self.runtime
                    .pull(&attachment.image, None)
                    .await
                    .map_err(|err| Error::source(ErrorKind::PullFailed, err))?;
            }

            // Shared attachments record every parent route; the monitor
            // removes them only once the last parent is gone.
            let parents: Vec<String> = snapshot
                .routes
                .values()
                .filter(|route| route.attachments.contains(name))
                .map(|route| route.domain.to_string())
                .collect();
            let spec_labels = HashMap::from([
                (labels::MANAGED.to_string(), "true".to_string()),
                (labels::ATTACH_PARENTS.to_string(), parents.join(",")),
            ]);

            let id = self
                .runtime
                .create(ContainerSpec {
                    name: container_name,
                    image: attachment.image.clone(),
                    labels: spec_labels,
                    env: attachment.env.clone(),
                    network: network.map(str::to_string),
                    network_alias: route
                        .network_group
                        .as_ref()
                        .map(|group| format!("{name}.{group}.internal")),
                    volumes: attachment.volumes.clone(),
                    container_port: None,
                    publish_loopback: false,
                })
                .await
                .map_err(|err| Error::source(ErrorKind::CreateFailed, err))?;
            self.runtime
                .start(&id)
                .await
                .map_err(|err| Error::source(ErrorKind::CreateFailed, err))?;
            info!(attachment = %name, "attachment started");
        }
        Ok(())
    }

    async fn list_with_retry(&self) -> Result<Vec<ContainerView>, Error> {
        let mut backoff = RETRY_BASE_BACKOFF;
        let mut attempts = 0;
        loop {
            match self.runtime.list_managed().await {
                Ok(containers) => return Ok(containers),
                Err(RuntimeError::Unavailable(reason)) if attempts < MAX_RUNTIME_RETRIES => {
                    attempts += 1;
                    warn!(%reason, attempt = attempts, "runtime unavailable, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(Error::from_kind(ErrorKind::Cancelled))
                        }
                    }
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Recover managed containers after a restart by label scan, and
    /// queue first deployments for routes with nothing serving them.
    pub async fn adopt(self: &Arc<Self>) -> Result<usize, Error> {
        let containers = self.list_with_retry().await?;
        let snapshot = self.config.snapshot();
        let mut adopted = 0;

        for view in &containers {
            if let Some(managed) = view.managed() {
                self.generations.observe(&managed.domain, managed.generation);
            }
        }

        for (domain, route) in &snapshot.routes {
            if let Some((managed, view)) = serving_container(&containers, domain) {
                debug!(%domain, container = %view.name, generation = managed.generation, "adopted running container");
                adopted += 1;
            } else if snapshot.deploy.auto_start {
                self.submit(DeployRequest::new(
                    domain.clone(),
                    route.image.clone(),
                    DeployReason::AutoStart,
                ));
            }
        }
        Ok(adopted)
    }

    /// Wait out in-flight deployments and drains, bounded.
    pub async fn shutdown(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let drains = std::mem::take(
            &mut *self.drains.lock().expect("drain table lock poisoned"),
        );
        for mut handle in drains {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    warn!("a drain task outlived shutdown and was aborted");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::oneshot;

    use crate::runtime::mock::MockRuntime;
    use crate::runtime::ContainerStatus;

    use super::*;

    const BASE_CONFIG: &str = r#"
[deploy]
probe-mode = "none"
drain-grace-secs = 0
stop-grace-secs = 0
lock-timeout-ms = 500

[routes."app.example.com"]
image = "myapp:latest"
port = 8080
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        resolver: Arc<Resolver>,
        deployer: Arc<Deployer>,
        cancel: CancellationToken,
    }

    async fn fixture(config_toml: &str) -> Fixture {
        fixture_with_catalog(config_toml, Arc::new(NoCatalog)).await
    }

    async fn fixture_with_catalog(
        config_toml: &str,
        catalog: Arc<dyn DigestLookup>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        tokio::fs::write(&path, config_toml).await.unwrap();

        let config = Arc::new(ConfigStore::load(&path).await.unwrap());
        let counters = Arc::new(Counters::default());
        let runtime = Arc::new(MockRuntime::new());
        let resolver = Resolver::new(runtime.clone(), config.clone(), counters.clone());
        let bus = EventBus::new(counters.clone());
        let env = Arc::new(EnvStore::new(dir.path()));
        let cancel = CancellationToken::new();
        let deployer = Deployer::new(
            runtime.clone(),
            config.clone(),
            resolver.clone(),
            bus,
            env,
            catalog,
            None,
            counters,
            cancel.clone(),
        );

        Fixture {
            _dir: dir,
            runtime,
            resolver,
            deployer,
            cancel,
        }
    }

    fn request(image: &str) -> DeployRequest {
        DeployRequest::new(
            "app.example.com".parse().unwrap(),
            image.parse().unwrap(),
            DeployReason::Manual,
        )
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn first_deploy_creates_generation_one() {
        let fx = fixture(BASE_CONFIG).await;

        let outcome = fx.deployer.deploy(request("myapp:latest")).await.unwrap();
        let DeployOutcome::Deployed { generation, .. } = outcome else {
            panic!("expected a deployment");
        };
        assert_eq!(generation, 1);
        assert_eq!(fx.runtime.running_names(), vec!["app-example-com-1"]);

        let target = fx
            .resolver
            .resolve(&"app.example.com".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(target.generation, 1);
        assert_eq!(target.port, 8080);
    }

    #[tokio::test]
    async fn second_deploy_swaps_and_removes_the_predecessor() {
        let fx = fixture(BASE_CONFIG).await;
        fx.deployer.deploy(request("myapp:latest")).await.unwrap();

        let mut push = request("myapp:latest");
        push.expected_digest = Some(format!("sha256:{}", "b".repeat(64)));
        let outcome = fx.deployer.deploy(push).await.unwrap();
        assert!(matches!(
            outcome,
            DeployOutcome::Deployed { generation: 2, .. }
        ));

        let runtime = fx.runtime.clone();
        wait_until("the old generation to drain", || {
            runtime.container_names() == vec!["app-example-com-2"]
        })
        .await;

        let target = fx
            .resolver
            .resolve(&"app.example.com".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(target.generation, 2);
    }

    #[tokio::test]
    async fn redeploying_the_served_image_is_a_no_op() {
        let fx = fixture(BASE_CONFIG).await;
        fx.deployer.deploy(request("myapp:latest")).await.unwrap();
        let creates_before = creates(&fx.runtime);

        let outcome = fx.deployer.deploy(request("myapp:latest")).await.unwrap();
        assert_eq!(outcome, DeployOutcome::NoOp);
        assert_eq!(creates(&fx.runtime), creates_before);
    }

    fn creates(runtime: &MockRuntime) -> usize {
        runtime
            .operations()
            .iter()
            .filter(|op| op.starts_with("create:"))
            .count()
    }

    #[tokio::test]
    async fn start_failure_leaves_no_orphans() {
        let fx = fixture(BASE_CONFIG).await;
        fx.runtime.fail_start_of("app-example-com-1");

        let err = fx.deployer.deploy(request("myapp:latest")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StartFailed);
        assert!(fx.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn unhealthy_probe_rolls_back_to_the_old_generation() {
        let closed_port = portpicker::pick_unused_port().expect("no free port");
        let config = format!(
            r#"
[deploy]
probe-mode = "tcp"
probe-timeout-secs = 1
drain-grace-secs = 0
stop-grace-secs = 0
lock-timeout-ms = 500

[routes."app.example.com"]
image = "myapp:2.0"
port = {closed_port}
"#
        );
        let fx = fixture(&config).await;
        let domain: DomainName = "app.example.com".parse().unwrap();

        // An older generation is serving.
        let old = ManagedLabels::new(domain.clone(), "myapp:1.0".parse().unwrap(), 1)
            .with_port(Some(closed_port));
        fx.runtime.seed_container(ContainerView {
            id: "old".to_string(),
            name: "app-example-com-1".to_string(),
            status: ContainerStatus::Running,
            labels: old.encode(),
            ip: Some(std::net::IpAddr::from([127, 0, 0, 1])),
            exposed_ports: vec![closed_port],
            published: vec![],
        });

        let err = fx.deployer.deploy(request("myapp:2.0")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unhealthy);

        // Exactly the pre-swap container set survives.
        assert_eq!(fx.runtime.container_names(), vec!["app-example-com-1"]);
        assert_eq!(fx.runtime.running_names(), vec!["app-example-com-1"]);
        let target = fx.resolver.resolve(&domain).await.unwrap();
        assert_eq!(target.generation, 1);
        assert_eq!(target.container_id, "old");
    }

    #[tokio::test]
    async fn concurrent_manual_deploys_create_exactly_one_container() {
        let fx = fixture(BASE_CONFIG).await;

        let first = {
            let deployer = fx.deployer.clone();
            tokio::spawn(async move { deployer.deploy(request("myapp:latest")).await })
        };
        let second = {
            let deployer = fx.deployer.clone();
            tokio::spawn(async move { deployer.deploy(request("myapp:latest")).await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        // One call deploys; the other serialises behind the domain lock
        // and lands on the no-op (or busy) path.
        assert!(results.iter().any(|result| matches!(
            result,
            Ok(DeployOutcome::Deployed { .. })
        )));
        for result in &results {
            match result {
                Ok(_) => {}
                Err(err) => assert_eq!(err.kind(), ErrorKind::Busy),
            }
        }
        assert_eq!(creates(&fx.runtime), 1);
    }

    struct GateCatalog {
        entered: Mutex<Option<oneshot::Sender<()>>>,
        open: AtomicBool,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl DigestLookup for GateCatalog {
        async fn digest_for(&self, _name: &str, _tag: &str) -> Option<String> {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                let _ = tx.send(());
            }
            while !self.open.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            None
        }
    }

    #[tokio::test]
    async fn queued_requests_coalesce_to_the_latest() {
        let (entered_tx, entered_rx) = oneshot::channel();
        let catalog = Arc::new(GateCatalog {
            entered: Mutex::new(Some(entered_tx)),
            open: AtomicBool::new(false),
            gate: tokio::sync::Notify::new(),
        });
        let fx = fixture_with_catalog(BASE_CONFIG, catalog.clone()).await;
        let domain: DomainName = "app.example.com".parse().unwrap();

        // This deploy blocks inside prepare, holding the domain lock.
        let blocked = {
            let deployer = fx.deployer.clone();
            tokio::spawn(async move {
                let mut first = request("myapp:1.0");
                first.expected_digest = Some(format!("sha256:{}", "a".repeat(64)));
                deployer.deploy(first).await
            })
        };
        entered_rx.await.unwrap();

        // Two more requests arrive; only the newest survives the slot.
        fx.deployer.submit(request("myapp:1.5"));
        fx.deployer.submit(request("myapp:2.0"));
        wait_until("requests to coalesce", || {
            fx.deployer
                .pending
                .lock()
                .unwrap()
                .get(&domain)
                .map(|pending| pending.image.to_string())
                == Some("myapp:2.0".to_string())
        })
        .await;

        catalog.open.store(true, Ordering::SeqCst);
        catalog.gate.notify_waiters();

        assert!(matches!(
            blocked.await.unwrap().unwrap(),
            DeployOutcome::Deployed { generation: 1, .. }
        ));

        // The coalesced follow-up runs after the lock frees.
        let runtime = fx.runtime.clone();
        wait_until("the coalesced deploy to land", || {
            runtime.running_names() == vec!["app-example-com-2"]
        })
        .await;
        let gen2 = fx.runtime.by_name("app-example-com-2").unwrap();
        assert_eq!(
            gen2.labels.get(labels::IMAGE).map(String::as_str),
            Some("myapp:2.0")
        );
    }

    #[tokio::test]
    async fn generations_never_restart_after_container_loss() {
        let fx = fixture(BASE_CONFIG).await;
        fx.deployer.deploy(request("myapp:latest")).await.unwrap();

        // The container vanishes outside any committed swap; the
        // per-domain counter still remembers generation 1.
        let gone = fx.runtime.by_name("app-example-com-1").unwrap();
        fx.runtime.remove(&gone.id).await.unwrap();

        let outcome = fx.deployer.deploy(request("myapp:latest")).await.unwrap();
        assert!(matches!(
            outcome,
            DeployOutcome::Deployed { generation: 2, .. }
        ));
        assert_eq!(fx.runtime.running_names(), vec!["app-example-com-2"]);
    }

    #[tokio::test]
    async fn cancelled_controller_refuses_new_deployments() {
        let fx = fixture(BASE_CONFIG).await;
        fx.cancel.cancel();
        let err = fx.deployer.deploy(request("myapp:latest")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn unavailable_runtime_fails_after_bounded_retries() {
        let fx = fixture(BASE_CONFIG).await;
        fx.runtime.set_available(false);
        let err = fx.deployer.deploy(request("myapp:latest")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
    }

    #[tokio::test]
    async fn adoption_with_nothing_changed_deploys_nothing() {
        let fx = fixture(BASE_CONFIG).await;
        let domain: DomainName = "app.example.com".parse().unwrap();
        let labels = ManagedLabels::new(domain, "myapp:latest".parse().unwrap(), 1)
            .with_port(Some(8080));
        fx.runtime.seed_container(ContainerView {
            id: "surviving".to_string(),
            name: "app-example-com-1".to_string(),
            status: ContainerStatus::Running,
            labels: labels.encode(),
            ip: Some(std::net::IpAddr::from([127, 0, 0, 1])),
            exposed_ports: vec![8080],
            published: vec![],
        });

        let adopted = fx.deployer.adopt().await.unwrap();
        assert_eq!(adopted, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.runtime.operations().is_empty());
    }

    #[tokio::test]
    async fn adoption_auto_starts_unserved_routes() {
        let fx = fixture(BASE_CONFIG).await;
        assert_eq!(fx.deployer.adopt().await.unwrap(), 0);

        let runtime = fx.runtime.clone();
        wait_until("the auto-start deploy", || {
            runtime.running_names() == vec!["app-example-com-1"]
        })
        .await;
    }
}
