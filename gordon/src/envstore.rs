//! Per-domain env files injected into deployed containers.
//!
//! `<runtime_dir>/env/<domain>.env`, plain `KEY=VALUE` lines. Secret
//! store back-ends sit behind the same shape; the file store is what
//! ships.

use std::path::{Path, PathBuf};

use gordon_common::DomainName;
use tracing::warn;

pub struct EnvStore {
    dir: PathBuf,
}

impl EnvStore {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            dir: runtime_dir.join("env"),
        }
    }

    /// Environment for a domain, empty when no file exists. Malformed
    /// lines are skipped with a warning rather than failing the deploy.
    pub async fn load(&self, domain: &DomainName) -> Vec<String> {
        let path = self.dir.join(format!("{domain}.env"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(%domain, %err, "env file unreadable");
                return Vec::new();
            }
        };

        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                if line.split_once('=').map_or(false, |(key, _)| !key.is_empty()) {
                    Some(line.to_string())
                } else {
                    warn!(%domain, line, "skipping malformed env line");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_env_lines_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path());
        let domain: DomainName = "app.example.com".parse().unwrap();

        tokio::fs::create_dir_all(dir.path().join("env"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("env/app.example.com.env"),
            "# comment\nDATABASE_URL=postgres://db/app\n\nBROKEN LINE\nPORT=3000\n",
        )
        .await
        .unwrap();

        let env = store.load(&domain).await;
        assert_eq!(env, vec!["DATABASE_URL=postgres://db/app", "PORT=3000"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path());
        assert!(store.load(&"app.example.com".parse().unwrap()).await.is_empty());
    }
}
