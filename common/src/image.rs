use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// In [OCI distribution spec](https://github.com/opencontainers/distribution-spec/blob/main/spec.md):
/// > `<name>` MUST match the following regular expression:
/// > ```text
/// > [a-z0-9]+([._-][a-z0-9]+)*(/[a-z0-9]+([._-][a-z0-9]+)*)*
/// > ```
static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*(/[a-z0-9]+([._-][a-z0-9]+)*)*$")
        .expect("to create a regex from pattern")
});

/// > `<reference>` as a tag MUST be at most 128 characters
/// > in length and MUST match the following regular expression:
/// > ```text
/// > [a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}
/// > ```
static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("to create a regex from pattern")
});

static DIGEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("to create a regex from pattern"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidImageReference {
    #[error("invalid image name: {0}")]
    Name(String),
    #[error("invalid image tag: {0}")]
    Tag(String),
    #[error("invalid image digest: {0}")]
    Digest(String),
}

/// A container image reference: `name[:tag][@sha256:...]`.
///
/// The name may carry a registry prefix (`registry.local:5000/app`); the
/// repository is everything up to the tag/digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, defaulting to `latest` when none was given.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The repository with any registry host stripped: the part the
    /// registry itself indexes by. `registry.local:5000/app` -> `app`.
    pub fn short_name(&self) -> &str {
        match self.repository.rsplit_once('/') {
            Some((head, name)) if head.contains('.') || head.contains(':') => name,
            _ => &self.repository,
        }
    }

    /// Whether two references point at the same repository, ignoring
    /// tag and digest.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.short_name() == other.short_name()
    }

    pub fn with_tag(&self, tag: &str) -> Result<Self, InvalidImageReference> {
        if !TAG_RE.is_match(tag) {
            return Err(InvalidImageReference::Tag(tag.to_string()));
        }
        Ok(Self {
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }
}

impl FromStr for ImageReference {
    type Err = InvalidImageReference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(InvalidImageReference::Digest(digest.to_string()));
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag; a colon before
        // it belongs to a registry host port.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                if !TAG_RE.is_match(tag) {
                    return Err(InvalidImageReference::Tag(tag.to_string()));
                }
                (repo.to_string(), Some(tag.to_string()))
            }
            _ => (rest.to_string(), None),
        };

        // Validate each path segment; registry hosts may carry dots and a
        // port, which the plain name regex does not allow.
        let name_part = match repository.split_once('/') {
            Some((head, rest)) if head.contains('.') || head.contains(':') => rest,
            _ => repository.as_str(),
        };
        if name_part.is_empty() || !NAME_RE.is_match(name_part) {
            return Err(InvalidImageReference::Name(s.to_string()));
        }

        Ok(Self {
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageReference {
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
    fn parses_bare_name() {
        let image: ImageReference = "myapp".parse().unwrap();
        assert_eq!(image.repository(), "myapp");
        assert_eq!(image.tag(), "latest");
        assert_eq!(image.digest(), None);
    }

    #[test]
    fn parses_name_and_tag() {
        let image: ImageReference = "myapp:1.2.3".parse().unwrap();
        assert_eq!(image.repository(), "myapp");
        assert_eq!(image.tag(), "1.2.3");
    }

    #[test]
    fn parses_registry_host_with_port() {
        let image: ImageReference = "registry.local:5000/myapp:latest".parse().unwrap();
        assert_eq!(image.repository(), "registry.local:5000/myapp");
        assert_eq!(image.short_name(), "myapp");
        assert_eq!(image.tag(), "latest");
    }

    #[test]
    fn parses_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let image: ImageReference = format!("myapp@{digest}").parse().unwrap();
        assert_eq!(image.digest(), Some(digest.as_str()));
    }

    #[test]
    fn rejects_bad_tags_and_digests() {
        assert!("myapp:has space".parse::<ImageReference>().is_err());
        assert!("myapp@sha256:short".parse::<ImageReference>().is_err());
        assert!("MYAPP".parse::<ImageReference>().is_err());
    }

    #[test]
    fn same_repository_ignores_tag() {
        let a: ImageReference = "registry.local:5000/myapp:1".parse().unwrap();
        let b: ImageReference = "myapp:2".parse().unwrap();
        assert!(a.same_repository(&b));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["myapp", "myapp:1.0", "registry.local:5000/myapp:latest"] {
            let image: ImageReference = raw.parse().unwrap();
            assert_eq!(image.to_string(), raw);
        }
    }
}
