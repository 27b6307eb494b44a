//! Background reconcile loop: restart crashed managed containers and
//! tear down the ones whose routes no longer exist.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Event, EventBus};
use crate::config::ConfigStore;
use crate::deploy::{DeployReason, DeployRequest, Deployer};
use crate::resolver::Resolver;
use crate::runtime::ContainerRuntime;
use crate::telemetry::{bump, Counters};
use crate::Error;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(15);

pub struct LifecycleMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ConfigStore>,
    deployer: Arc<Deployer>,
    resolver: Arc<Resolver>,
    bus: Arc<EventBus>,
    counters: Arc<Counters>,
    interval: Duration,
}

impl LifecycleMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<ConfigStore>,
        deployer: Arc<Deployer>,
        resolver: Arc<Resolver>,
        bus: Arc<EventBus>,
        counters: Arc<Counters>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            deployer,
            resolver,
            bus,
            counters,
            interval,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(err) = self.reconcile().await {
                warn!(%err, "monitor pass failed");
            }
        }
    }

    /// One reconcile pass over the label scan.
    pub async fn reconcile(&self) -> Result<(), Error> {
        let containers = self.runtime.list_managed().await?;
        let snapshot = self.config.snapshot();
        let stop_grace = Duration::from_secs(snapshot.deploy.stop_grace_secs);

        for view in &containers {
            if let Some(managed) = view.managed() {
                if snapshot.route(&managed.domain).is_none() {
                    info!(container = %view.name, domain = %managed.domain, "removing container without a route");
                    self.runtime.stop(&view.id, stop_grace).await.ok();
                    self.runtime.remove(&view.id).await.ok();
                    self.resolver.invalidate(&managed.domain);
                    let _ = self
                        .bus
                        .publish(Event::ContainerRemoved {
                            domain: managed.domain.clone(),
                            container_id: view.id.clone(),
                        })
                        .await;
                }
            } else if let Some(parents) = view.attach_parents() {
                // Attachments live as long as any parent route does.
                let orphaned = parents
                    .iter()
                    .all(|parent| snapshot.route(parent).is_none());
                if orphaned {
                    info!(container = %view.name, "removing orphaned attachment");
                    self.runtime.stop(&view.id, stop_grace).await.ok();
                    self.runtime.remove(&view.id).await.ok();
                }
            }
        }

        // Crashed routes: nothing running or in flight, newest attempt
        // exited or dead.
        for (domain, route) in &snapshot.routes {
            let mut saw_any = false;
            let mut any_alive = false;
            for view in &containers {
                let Some(managed) = view.managed() else { continue };
                if managed.domain != *domain {
                    continue;
                }
                saw_any = true;
                if view.status.is_running() || view.status.is_transitional() {
                    any_alive = true;
                }
            }
            if saw_any && !any_alive {
                info!(%domain, "restarting crashed container");
                bump(&self.counters.monitor_restarts);
                self.deployer.submit(DeployRequest::new(
                    domain.clone(),
                    route.image.clone(),
                    DeployReason::Monitor,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gordon_common::labels::{self, ManagedLabels};
    use gordon_common::DomainName;

    use crate::deploy::NoCatalog;
    use crate::envstore::EnvStore;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{ContainerStatus, ContainerView};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        resolver: Arc<Resolver>,
        monitor: Arc<LifecycleMonitor>,
    }

    async fn fixture(config_toml: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        tokio::fs::write(&path, config_toml).await.unwrap();

        let config = Arc::new(ConfigStore::load(&path).await.unwrap());
        let counters = Arc::new(Counters::default());
        let runtime = Arc::new(MockRuntime::new());
        let resolver = Resolver::new(runtime.clone(), config.clone(), counters.clone());
        let bus = EventBus::new(counters.clone());
        let deployer = Deployer::new(
            runtime.clone(),
            config.clone(),
            resolver.clone(),
            bus.clone(),
            Arc::new(EnvStore::new(dir.path())),
            Arc::new(NoCatalog),
            None,
            counters.clone(),
            CancellationToken::new(),
        );
        let monitor = LifecycleMonitor::new(
            runtime.clone(),
            config,
            deployer,
            resolver.clone(),
            bus,
            counters,
            MONITOR_INTERVAL,
        );
        Fixture {
            _dir: dir,
            runtime,
            resolver,
            monitor,
        }
    }

    fn container(domain: &str, generation: u64, id: &str, status: ContainerStatus) -> ContainerView {
        let labels = ManagedLabels::new(
            domain.parse().unwrap(),
            "myapp:latest".parse().unwrap(),
            generation,
        )
        .with_port(Some(8080));
        ContainerView {
            id: id.to_string(),
            name: format!("{}-{generation}", domain.replace('.', "-")),
            status,
            labels: labels.encode(),
            ip: Some(std::net::IpAddr::from([127, 0, 0, 1])),
            exposed_ports: vec![8080],
            published: vec![],
        }
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

    const ROUTED: &str = r#"
[deploy]
probe-mode = "none"
drain-grace-secs = 0

[routes."app.example.com"]
image = "myapp:latest"
port = 8080
"#;

    #[tokio::test]
    async fn crashed_container_is_redeployed() {
        let fx = fixture(ROUTED).await;
        fx.runtime
            .seed_container(container("app.example.com", 1, "dead1", ContainerStatus::Exited));

        fx.monitor.reconcile().await.unwrap();

        let runtime = fx.runtime.clone();
        wait_until("the crashed route to redeploy", || {
            runtime.running_names() == vec!["app-example-com-2"]
        })
        .await;
    }

    #[tokio::test]
    async fn running_containers_are_left_alone() {
        let fx = fixture(ROUTED).await;
        fx.runtime
            .seed_container(container("app.example.com", 1, "ok1", ContainerStatus::Running));

        fx.monitor.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.runtime.operations().is_empty());
    }

    #[tokio::test]
    async fn swap_in_flight_is_not_interfered_with() {
        let fx = fixture(ROUTED).await;
        fx.runtime
            .seed_container(container("app.example.com", 1, "old", ContainerStatus::Exited));
        fx.runtime
            .seed_container(container("app.example.com", 2, "new", ContainerStatus::Created));

        fx.monitor.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // No redeploy was queued while generation 2 is mid-start.
        assert!(fx
            .runtime
            .operations()
            .iter()
            .all(|op| !op.starts_with("create:")));
    }

    #[tokio::test]
    async fn routeless_containers_are_torn_down() {
        let fx = fixture("").await;
        let domain: DomainName = "gone.example.com".parse().unwrap();
        fx.runtime
            .seed_container(container("gone.example.com", 1, "c1", ContainerStatus::Running));

        fx.monitor.reconcile().await.unwrap();
        assert!(fx.runtime.container_names().is_empty());
        let err = fx.resolver.resolve(&domain).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RouteUnknown);
    }

    #[tokio::test]
    async fn orphaned_attachments_are_removed_with_the_last_parent() {
        let fx = fixture(ROUTED).await;
        // Attached to the live route and a dead one: stays.
        fx.runtime.seed_container(ContainerView {
            id: "attach".to_string(),
            name: "gordon-attach-db".to_string(),
            status: ContainerStatus::Running,
            labels: HashMap::from([
                (labels::MANAGED.to_string(), "true".to_string()),
                (
                    labels::ATTACH_PARENTS.to_string(),
                    "app.example.com,gone.example.com".to_string(),
                ),
            ]),
            ip: None,
            exposed_ports: vec![],
            published: vec![],
        });

        fx.monitor.reconcile().await.unwrap();
        assert_eq!(fx.runtime.container_names(), vec!["gordon-attach-db"]);

        // With no surviving parent: removed.
        fx.runtime.seed_container(ContainerView {
            id: "attach2".to_string(),
            name: "gordon-attach-cache".to_string(),
            status: ContainerStatus::Running,
            labels: HashMap::from([
                (labels::MANAGED.to_string(), "true".to_string()),
                (
                    labels::ATTACH_PARENTS.to_string(),
                    "gone.example.com".to_string(),
                ),
            ]),
            ip: None,
            exposed_ports: vec![],
            published: vec![],
        });
        fx.monitor.reconcile().await.unwrap();
        assert_eq!(fx.runtime.container_names(), vec!["gordon-attach-db"]);
    }
}
