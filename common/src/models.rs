use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{DomainName, ImageReference};

/// Annotation keys recognised on pushed manifests.
pub mod annotations {
    pub const DOMAIN: &str = "gordon.domain";
    pub const PORT: &str = "gordon.port";
    pub const VERSION: &str = "gordon.version";
}

/// A mapping from a public domain to the image that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: DomainName,
    pub image: ImageReference,
    /// Container port to target; when absent the image's first exposed
    /// port is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub attachments: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_group: Option<String>,
}

impl Route {
    pub fn new(domain: DomainName, image: ImageReference) -> Self {
        Self {
            domain,
            image,
            port: None,
            attachments: BTreeSet::new(),
            network_group: None,
        }
    }

    /// Whether a push of `pushed` should land on this route. The
    /// repository name decides, ignoring tags: a route pinned to one
    /// version still picks up pushes of other tags of the same image.
    pub fn matches_push(&self, pushed: &ImageReference) -> bool {
        self.image.same_repository(pushed)
    }
}

/// Domains sharing a user-defined bridge network for internal DNS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkGroup {
    #[serde(default)]
    pub members: BTreeSet<DomainName>,
}

/// An auxiliary service container (a database, a cache) referenced by
/// name from one or more routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub image: ImageReference,
    /// `volume-name:/container/path` mounts.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

/// Emitted by the registry when a manifest upload finalises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePushedEvent {
    /// Repository name as pushed, e.g. `myapp` or `staging.example.com`.
    pub name: String,
    pub reference: ImageReference,
    /// Canonical manifest digest, `sha256:...`.
    pub digest: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(image: &str) -> Route {
        Route::new("app.example.com".parse().unwrap(), image.parse().unwrap())
    }

    #[test]
    fn push_matches_by_repository_ignoring_tags() {
        let pushed: ImageReference = "myapp:2.0".parse().unwrap();
        assert!(route("myapp:latest").matches_push(&pushed));
        assert!(route("myapp:1.0").matches_push(&pushed));
        assert!(!route("other:2.0").matches_push(&pushed));
    }

    #[test]
    fn push_matching_ignores_registry_prefixes() {
        let pushed: ImageReference = "myapp:1.0".parse().unwrap();
        assert!(route("registry.local:5000/myapp:1.0").matches_push(&pushed));
    }

    #[test]
    fn route_toml_round_trip() {
        let mut original = route("myapp:latest");
        original.port = Some(8080);
        original.attachments.insert("db".to_string());

        let encoded = toml::to_string(&original).unwrap();
        let decoded: Route = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
