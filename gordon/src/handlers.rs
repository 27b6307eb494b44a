//! Bus subscribers wiring the platform together: config changes into
//! reconciles, manual triggers into the controller, and the registry's
//! hook onto the bus. The push→deploy handler lives in [`crate::push`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use gordon_common::models::ImagePushedEvent;
use gordon_registry::{RegistryHooks, RegistryStore};

use crate::bus::{Event, EventBus, EventHandler};
use crate::config::{ConfigStore, ReloadMode};
use crate::deploy::{DeployReason, DeployRequest, Deployer, DigestLookup};
use crate::resolver::Resolver;

/// Reconciles config changes: redeploy touched routes, invalidate
/// removed ones. Also services `manual-reload`.
pub struct ReloadHandler {
    config: Arc<ConfigStore>,
    deployer: Arc<Deployer>,
    resolver: Arc<Resolver>,
}

impl ReloadHandler {
    pub fn new(
        config: Arc<ConfigStore>,
        deployer: Arc<Deployer>,
        resolver: Arc<Resolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            deployer,
            resolver,
        })
    }
}

#[async_trait]
impl EventHandler for ReloadHandler {
    async fn handle(&self, event: Event) {
        match event {
            Event::ManualReload => match self.config.reload(ReloadMode::Full).await {
                // The reload emits `config-reload` for the touched
                // domains; the arm below picks those up.
                Ok(touched) => info!(domains = touched.len(), "manual reload applied"),
                Err(err) => warn!(%err, "manual reload failed"),
            },
            Event::ConfigReload { domains } => {
                for domain in domains {
                    match self.config.route(&domain) {
                        Some(route) => {
                            self.deployer.submit(DeployRequest::new(
                                domain,
                                route.image,
                                DeployReason::Reload,
                            ));
                        }
                        None => {
                            // The monitor tears the containers down;
                            // the proxy must stop resolving now.
                            self.resolver.invalidate(&domain);
                            info!(%domain, "route removed");
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Services `manual-deploy` events raised by SIGUSR2.
pub struct ManualDeployHandler {
    config: Arc<ConfigStore>,
    deployer: Arc<Deployer>,
}

impl ManualDeployHandler {
    pub fn new(config: Arc<ConfigStore>, deployer: Arc<Deployer>) -> Arc<Self> {
        Arc::new(Self { config, deployer })
    }
}

#[async_trait]
impl EventHandler for ManualDeployHandler {
    async fn handle(&self, event: Event) {
        let Event::ManualDeploy { domain } = event else {
            return;
        };
        match self.config.route(&domain) {
            Some(route) => {
                self.deployer.submit(DeployRequest::new(
                    domain,
                    route.image,
                    DeployReason::Manual,
                ));
            }
            None => warn!(%domain, "manual deploy for unknown route"),
        }
    }
}

/// The registry's push hook: forwards finalised pushes onto the bus.
/// A full bus drops the deploy, never the push.
pub struct BusHooks {
    bus: Arc<EventBus>,
}

impl BusHooks {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl RegistryHooks for BusHooks {
    async fn on_image_pushed(&self, event: ImagePushedEvent) {
        if let Err(err) = self.bus.publish(Event::ImagePushed(event)).await {
            warn!(%err, "image-pushed event dropped; the push itself succeeded");
        }
    }
}

/// Digest lookups answered by the co-hosted registry store.
pub struct StoreCatalog {
    store: Arc<dyn RegistryStore>,
}

impl StoreCatalog {
    pub fn new(store: Arc<dyn RegistryStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl DigestLookup for StoreCatalog {
    async fn digest_for(&self, name: &str, tag: &str) -> Option<String> {
        self.store.digest_for_tag(name, tag).await.ok().flatten()
    }
}
