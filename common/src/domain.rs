use std::fmt::Formatter;
use std::str::FromStr;

use fqdn::FQDN;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a valid public hostname")]
pub struct InvalidDomainName(String);

/// A public hostname a route is served under, e.g. `app.example.com`.
///
/// Parsing validates the string as a fully qualified domain name and
/// lowercases it, so two spellings of the same host compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainName(String);

impl DomainName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DNS-safe base for container names derived from this domain:
    /// dots become dashes. `app.example.com` -> `app-example-com`.
    pub fn sanitized(&self) -> String {
        self.0.replace('.', "-")
    }

    /// Deterministic name for the container serving swap generation `n`.
    pub fn container_name(&self, generation: u64) -> String {
        format!("{}-{}", self.sanitized(), generation)
    }
}

impl FromStr for DomainName {
    type Err = InvalidDomainName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('.');
        let _fqdn: FQDN = trimmed
            .parse()
            .map_err(|_| InvalidDomainName(s.to_string()))?;
        // A route must name a host, not a bare TLD, and container and
        // DNS naming restricts labels beyond what FQDN parsing does.
        let labels_ok = trimmed.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
        if !trimmed.contains('.') || !labels_ok {
            return Err(InvalidDomainName(s.to_string()));
        }
        Ok(Self(trimmed.to_lowercase()))
    }
}

impl std::fmt::Display for DomainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for DomainName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DomainName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hostnames() {
        assert!("app.example.com".parse::<DomainName>().is_ok());
        assert!("staging.example.com".parse::<DomainName>().is_ok());
        assert!("x.co".parse::<DomainName>().is_ok());
    }

    #[test]
    fn rejects_non_hostnames() {
        assert!("".parse::<DomainName>().is_err());
        assert!("localhost".parse::<DomainName>().is_err());
        assert!("has space.example.com".parse::<DomainName>().is_err());
        assert!("under_score.example.com".parse::<DomainName>().is_err());
    }

    #[test]
    fn lowercases() {
        let domain: DomainName = "App.Example.COM".parse().unwrap();
        assert_eq!(domain.as_str(), "app.example.com");
    }

    #[test]
    fn sanitizes_for_container_names() {
        let domain: DomainName = "app.example.com".parse().unwrap();
        assert_eq!(domain.sanitized(), "app-example-com");
        assert_eq!(domain.container_name(2), "app-example-com-2");
    }
}
