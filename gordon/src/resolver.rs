//! The route target cache: per-domain memoisation of where a domain's
//! traffic goes, consulted by the proxy on every request.
//!
//! Resolution is single-flight per domain. Cache entries carry the swap
//! generation, and a write whose generation is older than what the
//! cache holds is discarded, so a slow resolver losing a race against a
//! swap can never clobber the fresh target. Failures are cached
//! negatively for at most a second to keep request storms off the
//! runtime API.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use ttl_cache::TtlCache;

use gordon_common::DomainName;

use crate::config::{ConfigStore, NetworkMode};
use crate::runtime::{serving_container, ContainerRuntime, RuntimeError};
use crate::telemetry::{bump, Counters};
use crate::{Error, ErrorKind};

const NEGATIVE_TTL: Duration = Duration::from_secs(1);
const NEGATIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: IpAddr,
    pub port: u16,
    pub container_id: String,
    pub generation: u64,
}

type InFlightResult = Option<Result<ResolvedTarget, ErrorKind>>;

pub struct Resolver {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ConfigStore>,
    cache: RwLock<HashMap<DomainName, ResolvedTarget>>,
    negative: Mutex<TtlCache<DomainName, ErrorKind>>,
    inflight: tokio::sync::Mutex<HashMap<DomainName, watch::Receiver<InFlightResult>>>,
    counters: Arc<Counters>,
}

impl Resolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<ConfigStore>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            cache: RwLock::new(HashMap::new()),
            negative: Mutex::new(TtlCache::new(NEGATIVE_CAPACITY)),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            counters,
        })
    }

    /// The address of a running container serving `domain`.
    pub async fn resolve(&self, domain: &DomainName) -> Result<ResolvedTarget, Error> {
        if self.config.route(domain).is_none() {
            return Err(Error::from_kind(ErrorKind::RouteUnknown));
        }

        if let Some(target) = self.cached(domain) {
            match self.runtime.inspect(&target.container_id).await {
                Ok(Some(view)) if view.status.is_running() => {
                    bump(&self.counters.resolver_hits);
                    return Ok(target);
                }
                // When the daemon is unreachable a cached target is the
                // best answer available; failing the request helps no one.
                Err(RuntimeError::Unavailable(reason)) => {
                    warn!(%domain, %reason, "runtime unreachable, serving cached target");
                    bump(&self.counters.resolver_hits);
                    return Ok(target);
                }
                _ => {}
            }
        }

        if let Some(kind) = self.negative_get(domain) {
            bump(&self.counters.resolver_negative_hits);
            return Err(Error::from_kind(kind));
        }

        bump(&self.counters.resolver_misses);
        self.single_flight(domain).await
    }

    async fn single_flight(&self, domain: &DomainName) -> Result<ResolvedTarget, Error> {
        loop {
            let mut inflight = self.inflight.lock().await;
            if let Some(receiver) = inflight.get(domain) {
                let mut receiver = receiver.clone();
                drop(inflight);
                loop {
                    if let Some(result) = receiver.borrow().clone() {
                        return result.map_err(Error::from_kind);
                    }
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
                // The leader vanished without publishing; race again.
                continue;
            }

            let (sender, receiver) = watch::channel(None);
            inflight.insert(domain.clone(), receiver);
            drop(inflight);

            let result = self.resolve_slow(domain).await;
            match &result {
                Ok(target) => {
                    self.store_if_newer(domain, target.clone());
                }
                Err(kind) => self.negative_put(domain, *kind),
            }
            self.inflight.lock().await.remove(domain);
            let _ = sender.send(Some(result.clone()));
            return result.map_err(Error::from_kind);
        }
    }

    async fn resolve_slow(&self, domain: &DomainName) -> Result<ResolvedTarget, ErrorKind> {
        let snapshot = self.config.snapshot();
        let route = snapshot.route(domain).ok_or(ErrorKind::RouteUnknown)?;

        let containers = self.runtime.list_managed().await.map_err(|err| match err {
            RuntimeError::Unavailable(_) => ErrorKind::RuntimeUnavailable,
            _ => ErrorKind::Internal,
        })?;
        let (labels, view) =
            serving_container(&containers, domain).ok_or(ErrorKind::Unhealthy)?;

        let port = route
            .port
            .or(labels.port)
            .or_else(|| view.exposed_ports.first().copied())
            .ok_or(ErrorKind::Unhealthy)?;

        let target = match snapshot.server.network_mode {
            NetworkMode::Bridge => ResolvedTarget {
                host: view.ip.ok_or(ErrorKind::Unhealthy)?,
                port,
                container_id: view.id,
                generation: labels.generation,
            },
            NetworkMode::HostPort => ResolvedTarget {
                host: IpAddr::from([127, 0, 0, 1]),
                port: view.host_port_for(port).ok_or(ErrorKind::Unhealthy)?,
                container_id: view.id,
                generation: labels.generation,
            },
        };
        debug!(%domain, host = %target.host, port = target.port, generation = target.generation, "resolved");
        Ok(target)
    }

    /// The commit point of a swap: publish the new target and clear the
    /// negative state in one critical section, so the next resolution
    /// observes the new entry and stale writers are discarded by
    /// generation.
    pub fn commit_target(&self, domain: &DomainName, target: ResolvedTarget) {
        self.store_if_newer(domain, target);
        self.negative_remove(domain);
    }

    /// Drop everything cached for a domain; used when its route goes
    /// away or its containers are torn down.
    pub fn invalidate(&self, domain: &DomainName) {
        self.cache
            .write()
            .expect("resolver cache lock poisoned")
            .remove(domain);
        self.negative_remove(domain);
    }

    pub(crate) fn store_if_newer(&self, domain: &DomainName, target: ResolvedTarget) -> bool {
        let mut cache = self.cache.write().expect("resolver cache lock poisoned");
        match cache.get(domain) {
            Some(existing) if existing.generation > target.generation => false,
            _ => {
                cache.insert(domain.clone(), target);
                true
            }
        }
    }

    fn cached(&self, domain: &DomainName) -> Option<ResolvedTarget> {
        self.cache
            .read()
            .expect("resolver cache lock poisoned")
            .get(domain)
            .cloned()
    }

    fn negative_get(&self, domain: &DomainName) -> Option<ErrorKind> {
        self.negative
            .lock()
            .expect("resolver negative lock poisoned")
            .get(domain)
            .copied()
    }

    fn negative_put(&self, domain: &DomainName, kind: ErrorKind) {
        self.negative
            .lock()
            .expect("resolver negative lock poisoned")
            .insert(domain.clone(), kind, NEGATIVE_TTL);
    }

    fn negative_remove(&self, domain: &DomainName) {
        self.negative
            .lock()
            .expect("resolver negative lock poisoned")
            .remove(domain);
    }
}
