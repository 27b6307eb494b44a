//! The label protocol stamped on every container gordon owns.
//!
//! Labels are the only persisted deployment state: restart recovery is a
//! label scan against the runtime, nothing else. The keys and value
//! formats here are bit-stable.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{DomainName, ImageReference};

pub const MANAGED: &str = "gordon.managed";
pub const DOMAIN: &str = "gordon.domain";
pub const IMAGE: &str = "gordon.image";
pub const GENERATION: &str = "gordon.generation";
pub const PORT: &str = "gordon.port";
pub const STARTED_AT: &str = "gordon.started-at";
/// Parent domains of an attachment container, comma separated.
pub const ATTACH_PARENTS: &str = "gordon.attach-parents";

/// The decoded label set of a managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedLabels {
    pub domain: DomainName,
    pub image: ImageReference,
    pub generation: u64,
    pub port: Option<u16>,
    pub started_at: DateTime<Utc>,
}

impl ManagedLabels {
    pub fn new(domain: DomainName, image: ImageReference, generation: u64) -> Self {
        Self {
            domain,
            image,
            generation,
            port: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn encode(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (MANAGED.to_string(), "true".to_string()),
            (DOMAIN.to_string(), self.domain.to_string()),
            (IMAGE.to_string(), self.image.to_string()),
            (GENERATION.to_string(), self.generation.to_string()),
            (
                STARTED_AT.to_string(),
                self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]);
        if let Some(port) = self.port {
            labels.insert(PORT.to_string(), port.to_string());
        }
        labels
    }

    /// Decode from a runtime label map. Returns `None` for containers
    /// gordon does not own or whose labels are unreadable.
    pub fn parse(labels: &HashMap<String, String>) -> Option<Self> {
        if labels.get(MANAGED).map(String::as_str) != Some("true") {
            return None;
        }
        let domain = DomainName::from_str(labels.get(DOMAIN)?).ok()?;
        let image = ImageReference::from_str(labels.get(IMAGE)?).ok()?;
        let generation = labels.get(GENERATION)?.parse().ok()?;
        let port = labels.get(PORT).and_then(|p| p.parse().ok());
        let started_at = labels
            .get(STARTED_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(Self {
            domain,
            image,
            generation,
            port,
            started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> ManagedLabels {
        ManagedLabels::new(
            "app.example.com".parse().unwrap(),
            "myapp:latest".parse().unwrap(),
            3,
        )
        .with_port(Some(8080))
    }

    #[test]
    fn encode_parse_round_trip() {
        let original = labels();
        let parsed = ManagedLabels::parse(&original.encode()).unwrap();
        assert_eq!(parsed.domain, original.domain);
        assert_eq!(parsed.image, original.image);
        assert_eq!(parsed.generation, 3);
        assert_eq!(parsed.port, Some(8080));
    }

    #[test]
    fn ignores_unmanaged_containers() {
        let mut encoded = labels().encode();
        encoded.remove(MANAGED);
        assert!(ManagedLabels::parse(&encoded).is_none());

        encoded.insert(MANAGED.to_string(), "false".to_string());
        assert!(ManagedLabels::parse(&encoded).is_none());
    }

    #[test]
    fn tolerates_missing_optional_labels() {
        let mut encoded = labels().encode();
        encoded.remove(PORT);
        encoded.remove(STARTED_AT);
        let parsed = ManagedLabels::parse(&encoded).unwrap();
        assert_eq!(parsed.port, None);
    }
}
