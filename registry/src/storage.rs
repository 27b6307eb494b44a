//! Content-addressed filesystem store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<hex>          blob and manifest bytes
//! manifests/<name>/<tag>.json tag -> { digest, media_type }
//! uploads/<uuid>              in-progress upload sessions
//! ```
//!
//! Writes land in a staging file and are promoted by rename, so a
//! crashed upload never leaves a half-written blob addressable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{Error, Result};

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    pub digest: String,
    pub media_type: String,
    pub data: Bytes,
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn blob_exists(&self, digest: &str) -> Result<bool>;
    async fn get_blob(&self, digest: &str) -> Result<Bytes>;

    async fn start_upload(&self) -> Result<String>;
    async fn append_upload(&self, session: &str, chunk: Bytes) -> Result<u64>;
    /// Promote a session to a blob, verifying the client digest.
    async fn finish_upload(&self, session: &str, digest: &str) -> Result<String>;

    async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<String>;
    async fn get_manifest(&self, name: &str, reference: &str) -> Result<StoredManifest>;
    /// The manifest digest a tag currently points at, if any.
    async fn digest_for_tag(&self, name: &str, tag: &str) -> Result<Option<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TagLink {
    digest: String,
    media_type: String,
}

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["blobs/sha256", "manifests", "uploads"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| Error::InvalidReference(digest.to_string()))?;
        Ok(self.root.join("blobs/sha256").join(hex))
    }

    fn upload_path(&self, session: &str) -> Result<PathBuf> {
        // Session ids are uuids we minted; anything else is rejected
        // before it can traverse the filesystem.
        Uuid::parse_str(session).map_err(|_| Error::UploadUnknown(session.to_string()))?;
        Ok(self.root.join("uploads").join(session))
    }

    fn tag_path(&self, name: &str, reference: &str) -> Result<PathBuf> {
        if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if !valid_reference(reference) {
            return Err(Error::InvalidReference(reference.to_string()));
        }
        Ok(self
            .root
            .join("manifests")
            .join(name)
            .join(format!("{reference}.json")))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let staging = self
            .root
            .join("uploads")
            .join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for FsStore {
    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)?).await?)
    }

    async fn get_blob(&self, digest: &str) -> Result<Bytes> {
        match tokio::fs::read(self.blob_path(digest)?).await {
            Ok(data) => Ok(data.into()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BlobUnknown(digest.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn start_upload(&self) -> Result<String> {
        let session = Uuid::new_v4().to_string();
        tokio::fs::File::create(self.upload_path(&session)?).await?;
        Ok(session)
    }

    async fn append_upload(&self, session: &str, chunk: Bytes) -> Result<u64> {
        let path = self.upload_path(session)?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => Error::UploadUnknown(session.to_string()),
                _ => Error::Storage(err),
            })?;
        file.write_all(&chunk).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    async fn finish_upload(&self, session: &str, digest: &str) -> Result<String> {
        let path = self.upload_path(session)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::UploadUnknown(session.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let actual = sha256_digest(&data);
        if actual != digest {
            tokio::fs::remove_file(&path).await.ok();
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }

        tokio::fs::rename(&path, self.blob_path(digest)?).await?;
        Ok(actual)
    }

    async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<String> {
        let digest = sha256_digest(&data);
        self.write_atomic(&self.blob_path(&digest)?, &data).await?;

        // Digest-addressed pushes link under a filesystem-safe key.
        let is_digest_reference = reference.starts_with("sha256:");
        let key = if is_digest_reference {
            reference.replace(':', "-")
        } else {
            reference.to_string()
        };
        let link_path = self.tag_path(name, &key)?;
        if let Some(parent) = link_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let link = TagLink {
            digest: digest.clone(),
            media_type: media_type.to_string(),
        };
        self.write_atomic(&link_path, &serde_json::to_vec(&link).unwrap_or_default())
            .await?;

        // Pulls by digest resolve through the same link layout.
        if !is_digest_reference {
            let by_digest = self.tag_path(name, &digest.replace(':', "-"))?;
            self.write_atomic(&by_digest, &serde_json::to_vec(&link).unwrap_or_default())
                .await?;
        }

        Ok(digest)
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> Result<StoredManifest> {
        let key = if reference.starts_with("sha256:") {
            reference.replace(':', "-")
        } else {
            reference.to_string()
        };
        let raw = match tokio::fs::read(self.tag_path(name, &key)?).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ManifestUnknown(format!("{name}:{reference}")))
            }
            Err(err) => return Err(err.into()),
        };
        let link: TagLink = serde_json::from_slice(&raw)
            .map_err(|_| Error::ManifestUnknown(format!("{name}:{reference}")))?;
        let data = self.get_blob(&link.digest).await?;
        Ok(StoredManifest {
            digest: link.digest,
            media_type: link.media_type,
            data,
        })
    }

    async fn digest_for_tag(&self, name: &str, tag: &str) -> Result<Option<String>> {
        match tokio::fs::read(self.tag_path(name, tag)?).await {
            Ok(raw) => Ok(serde_json::from_slice::<TagLink>(&raw)
                .ok()
                .map(|link| link.digest)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'))
}

fn valid_reference(reference: &str) -> bool {
    !reference.is_empty()
        && reference.len() <= 135
        && reference
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}
