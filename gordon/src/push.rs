//! The push→deploy handler: correlates `image-pushed` events to routes
//! and enqueues deployments, auto-creating a route when the pushed
//! image names a public hostname.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use gordon_common::models::{annotations, ImagePushedEvent, Route};
use gordon_common::DomainName;

use crate::bus::{Event, EventHandler};
use crate::config::ConfigStore;
use crate::deploy::{DeployReason, DeployRequest, Deployer};

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

pub struct PushToDeploy {
    config: Arc<ConfigStore>,
    deployer: Arc<Deployer>,
    recent: Mutex<HashMap<(String, String), Instant>>,
}

impl PushToDeploy {
    pub fn new(config: Arc<ConfigStore>, deployer: Arc<Deployer>) -> Arc<Self> {
        Arc::new(Self {
            config,
            deployer,
            recent: Mutex::new(HashMap::new()),
        })
    }

    /// Duplicate `(name, digest)` pushes inside the window collapse to
    /// one deploy.
    fn debounced(&self, name: &str, digest: &str) -> bool {
        let key = (name.to_string(), digest.to_string());
        let now = Instant::now();
        let mut recent = self.recent.lock().expect("debounce lock poisoned");
        recent.retain(|_, at| now.duration_since(*at) < DEBOUNCE_WINDOW);
        if recent.contains_key(&key) {
            true
        } else {
            recent.insert(key, now);
            false
        }
    }

    async fn on_push(&self, push: ImagePushedEvent) {
        if self.debounced(&push.name, &push.digest) {
            debug!(name = %push.name, "duplicate push debounced");
            return;
        }

        // `gordon.version` pins the tag to deploy regardless of what
        // was pushed.
        let reference = match push.annotations.get(annotations::VERSION) {
            Some(version) => match push.reference.with_tag(version) {
                Ok(reference) => reference,
                Err(err) => {
                    warn!(name = %push.name, %err, "unusable gordon.version annotation");
                    return;
                }
            },
            None => push.reference.clone(),
        };
        let port_hint = push
            .annotations
            .get(annotations::PORT)
            .and_then(|port| port.parse().ok());

        let snapshot = self.config.snapshot();
        let route = match snapshot
            .routes
            .values()
            .find(|route| route.matches_push(&reference))
        {
            Some(route) => route.clone(),
            None if snapshot.deploy.auto_route => {
                let domain = push
                    .annotations
                    .get(annotations::DOMAIN)
                    .and_then(|domain| domain.parse::<DomainName>().ok())
                    .or_else(|| push.name.parse().ok());
                let Some(domain) = domain else {
                    debug!(name = %push.name, "push matches no route and no usable auto-route domain");
                    return;
                };
                let mut route = Route::new(domain.clone(), reference.clone());
                route.port = port_hint;
                match self.config.add_route(route.clone()).await {
                    Ok(added) => {
                        if added {
                            info!(%domain, "auto-created route for pushed image");
                        }
                        self.config.route(&domain).unwrap_or(route)
                    }
                    Err(err) => {
                        warn!(%domain, %err, "failed to auto-create route");
                        return;
                    }
                }
            }
            None => {
                debug!(name = %push.name, "push matches no route");
                return;
            }
        };

        let mut request =
            DeployRequest::new(route.domain.clone(), reference, DeployReason::Push);
        request.expected_digest = Some(push.digest.clone());
        request.port_hint = port_hint;
        self.deployer.submit(request);
    }
}

#[async_trait]
impl EventHandler for PushToDeploy {
    async fn handle(&self, event: Event) {
        if let Event::ImagePushed(push) = event {
            self.on_push(push).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_util::sync::CancellationToken;

    use crate::bus::EventBus;
    use crate::deploy::NoCatalog;
    use crate::envstore::EnvStore;
    use crate::resolver::Resolver;
    use crate::runtime::mock::MockRuntime;
    use crate::telemetry::Counters;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        config: Arc<ConfigStore>,
        handler: Arc<PushToDeploy>,
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
            resolver,
            bus,
            Arc::new(EnvStore::new(dir.path())),
            Arc::new(NoCatalog),
            None,
            counters,
            CancellationToken::new(),
        );
        let handler = PushToDeploy::new(config.clone(), deployer);
        Fixture {
            _dir: dir,
            runtime,
            config,
            handler,
        }
    }

    fn push(name: &str, digest_fill: char) -> ImagePushedEvent {
        ImagePushedEvent {
            name: name.to_string(),
            reference: format!("{name}:latest").parse().unwrap(),
            digest: format!("sha256:{}", digest_fill.to_string().repeat(64)),
            annotations: BTreeMap::new(),
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
    async fn push_deploys_the_matching_route() {
        let fx = fixture(ROUTED).await;
        fx.handler.on_push(push("myapp", 'a')).await;

        let runtime = fx.runtime.clone();
        wait_until("push-triggered deploy", || {
            runtime.running_names() == vec!["app-example-com-1"]
        })
        .await;
    }

    #[tokio::test]
    async fn push_of_another_tag_lands_on_a_pinned_route() {
        let pinned = r#"
[deploy]
probe-mode = "none"
drain-grace-secs = 0

[routes."app.example.com"]
image = "myapp:1.0"
port = 8080
"#;
        let fx = fixture(pinned).await;
        let mut event = push("myapp", 'a');
        event.reference = "myapp:2.0".parse().unwrap();
        fx.handler.on_push(event).await;

        let runtime = fx.runtime.clone();
        wait_until("the repository-matched deploy", || {
            runtime.running_names() == vec!["app-example-com-1"]
        })
        .await;
        let view = fx.runtime.by_name("app-example-com-1").unwrap();
        assert_eq!(
            view.labels.get(gordon_common::labels::IMAGE).map(String::as_str),
            Some("myapp:2.0")
        );
    }

    #[tokio::test]
    async fn duplicate_pushes_in_the_window_collapse() {
        let fx = fixture(ROUTED).await;
        fx.handler.on_push(push("myapp", 'a')).await;
        fx.handler.on_push(push("myapp", 'a')).await;
        fx.handler.on_push(push("myapp", 'a')).await;

        let runtime = fx.runtime.clone();
        wait_until("push-triggered deploy", || {
            runtime.running_names() == vec!["app-example-com-1"]
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let creates = fx
            .runtime
            .operations()
            .iter()
            .filter(|op| op.starts_with("create:"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn unmatched_push_without_auto_route_is_ignored() {
        let fx = fixture(ROUTED).await;
        fx.handler.on_push(push("unrelated", 'a')).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.runtime.operations().is_empty());
    }

    #[tokio::test]
    async fn auto_route_creates_and_deploys_hostname_images() {
        let config = r#"
[deploy]
probe-mode = "none"
auto-route = true
"#;
        let fx = fixture(config).await;
        fx.handler.on_push(push("staging.example.com", 'a')).await;

        let domain: DomainName = "staging.example.com".parse().unwrap();
        assert!(fx.config.route(&domain).is_some());

        let runtime = fx.runtime.clone();
        wait_until("auto-routed deploy", || {
            runtime.running_names() == vec!["staging-example-com-1"]
        })
        .await;
    }

    #[tokio::test]
    async fn version_annotation_overrides_the_pushed_tag() {
        let fx = fixture(ROUTED).await;
        let mut event = push("myapp", 'a');
        event
            .annotations
            .insert(annotations::VERSION.to_string(), "1.2.3".to_string());
        fx.handler.on_push(event).await;

        let runtime = fx.runtime.clone();
        wait_until("pinned-version deploy", || {
            runtime.running_names() == vec!["app-example-com-1"]
        })
        .await;
        let view = fx.runtime.by_name("app-example-com-1").unwrap();
        assert_eq!(
            view.labels.get(gordon_common::labels::IMAGE).map(String::as_str),
            Some("myapp:1.2.3")
        );
    }
}
